//! Utility functions for content normalization, logging, and the file system.
//!
//! - HTML to markdown conversion for article bodies
//! - String truncation for log previews
//! - Parent directory creation for on-disk databases and exports

use scraper::{ElementRef, Html};
use std::path::Path;
use tokio::fs;
use tracing::{debug, instrument};

/// Elements that never carry article text.
const ALWAYS_DROPPED: &[&str] = &["script", "style", "noscript", "template"];

/// What to strip from an article body before converting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlFilter<'a> {
    pub tags: &'a [&'a str],
    pub ids: &'a [&'a str],
    pub classes: &'a [&'a str],
}

impl HtmlFilter<'_> {
    fn drops(&self, el: &ElementRef<'_>) -> bool {
        let value = el.value();
        let name = value.name();
        if ALWAYS_DROPPED.contains(&name) || self.tags.contains(&name) {
            return true;
        }
        if let Some(id) = value.id() {
            if self.ids.contains(&id) {
                return true;
            }
        }
        value.classes().any(|c| self.classes.contains(&c))
    }
}

/// Convert an HTML fragment into markdown text.
///
/// Block elements become paragraphs, headings keep their level, list items
/// become `- ` bullets, links keep their target. Anything matched by
/// `filter` is dropped together with its children.
pub fn html_to_markdown(html: &str, filter: &HtmlFilter<'_>) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len() / 2);
    render(fragment.root_element(), filter, &mut out);
    tidy(&out)
}

fn render(el: ElementRef<'_>, filter: &HtmlFilter<'_>, out: &mut String) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if filter.drops(&child_el) {
                continue;
            }
            match child_el.value().name() {
                "p" | "div" | "section" | "article" | "blockquote" | "figure" | "table" | "tr"
                | "ul" | "ol" => {
                    out.push_str("\n\n");
                    render(child_el, filter, out);
                    out.push_str("\n\n");
                }
                name @ ("h1" | "h2" | "h3" | "h4" | "h5" | "h6") => {
                    let level = name[1..].parse::<usize>().unwrap_or(1);
                    out.push_str("\n\n");
                    out.push_str(&"#".repeat(level));
                    out.push(' ');
                    render(child_el, filter, out);
                    out.push_str("\n\n");
                }
                "li" => {
                    out.push_str("\n- ");
                    render(child_el, filter, out);
                }
                "br" => out.push('\n'),
                "strong" | "b" => wrap_inline(child_el, filter, out, "**"),
                "em" | "i" => wrap_inline(child_el, filter, out, "*"),
                "a" => match child_el.value().attr("href") {
                    Some(href) if !href.starts_with('#') => {
                        out.push('[');
                        render(child_el, filter, out);
                        out.push_str("](");
                        out.push_str(href);
                        out.push(')');
                    }
                    _ => render(child_el, filter, out),
                },
                _ => render(child_el, filter, out),
            }
        } else if let Some(text) = child.value().as_text() {
            push_text(text, out);
        }
    }
}

fn wrap_inline(el: ElementRef<'_>, filter: &HtmlFilter<'_>, out: &mut String, marker: &str) {
    let mut inner = String::new();
    render(el, filter, &mut inner);
    let inner = inner.trim();
    if inner.is_empty() {
        return;
    }
    out.push_str(marker);
    out.push_str(inner);
    out.push_str(marker);
}

fn push_text(text: &str, out: &mut String) {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let ends_with_space = out.ends_with(char::is_whitespace) || out.is_empty();
    if text.starts_with(char::is_whitespace) && !ends_with_space {
        out.push(' ');
    }
    out.push_str(&collapsed);
    if text.ends_with(char::is_whitespace) && !collapsed.is_empty() {
        out.push(' ');
    }
}

/// Trim every line and collapse runs of blank lines into one.
fn tidy(raw: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut blank = true;
    for line in raw.lines().map(str::trim) {
        if line.is_empty() {
            if !blank {
                lines.push("");
            }
            blank = true;
        } else {
            lines.push(line);
            blank = false;
        }
    }
    while lines.last() == Some(&"") {
        lines.pop();
    }
    lines.join("\n")
}

/// Truncate a string for logging purposes.
///
/// Long strings are truncated to at most `max` bytes (on a char boundary)
/// with an ellipsis and byte count indicator appended.
///
/// # Examples
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log("a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Make sure the directory that will hold `path` exists.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
            debug!("Parent directory ready");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_for_log_short_string() {
        let s = "Hello, world!";
        assert_eq!(truncate_for_log(s, 100), "Hello, world!");
    }

    #[test]
    fn test_truncate_for_log_long_string() {
        let s = "a".repeat(500);
        let result = truncate_for_log(&s, 100);
        assert!(result.starts_with(&"a".repeat(100)));
        assert!(result.contains("…(+400 bytes)"));
    }

    #[test]
    fn test_truncate_for_log_respects_char_boundary() {
        let s = "ñ".repeat(10);
        let result = truncate_for_log(&s, 3);
        assert!(result.starts_with('ñ'));
        assert!(result.contains("(+18 bytes)"));
    }

    #[test]
    fn test_paragraphs_and_headings() {
        let html = "<h2>Senate  passes\n budget</h2><p>First <b>bold</b> line.</p><p>Second</p>";
        let md = html_to_markdown(html, &HtmlFilter::default());
        assert_eq!(md, "## Senate passes budget\n\nFirst **bold** line.\n\nSecond");
    }

    #[test]
    fn test_lists_and_links() {
        let html = r#"<ul><li>One</li><li><a href="https://example.com/x">Two</a></li></ul>"#;
        let md = html_to_markdown(html, &HtmlFilter::default());
        assert_eq!(md, "- One\n- [Two](https://example.com/x)");
    }

    #[test]
    fn test_filters_drop_unwanted_nodes() {
        let html = r#"
            <div id="FOR_target_content">
                <p>Keep me</p>
                <script>var x = 1;</script>
                <div id="billboard_article">Ad</div>
                <div class="ztoop other">Promo</div>
                <figure><img src="a.jpg"><figcaption>Caption</figcaption></figure>
            </div>"#;
        let filter = HtmlFilter {
            tags: &["figure"],
            ids: &["billboard_article"],
            classes: &["ztoop"],
        };
        let md = html_to_markdown(html, &filter);
        assert_eq!(md, "Keep me");
    }

    #[tokio::test]
    async fn test_ensure_parent_dir_creates_missing_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("a/b/articles.db");
        ensure_parent_dir(&target).await.unwrap();
        assert!(tmp.path().join("a/b").is_dir());
    }
}
