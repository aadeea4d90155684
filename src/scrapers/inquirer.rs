//! Philippine Daily Inquirer fetcher.
//!
//! The Inquirer has no article API, so this fetcher reads the daily archive
//! page `https://www.inquirer.net/article-index/?d=YYYY-MM-DD` and then each
//! linked article page.
//!
//! # Archive Layout
//!
//! Every `<h4>` on the archive page names a section; the first `<ul>`
//! following it holds that section's article links.
//!
//! # Article Pages
//!
//! Sections live on different subdomains (`newsinfo`, `lifestyle`, `pop`,
//! `cebudailynews`, `bandera`, ...) and each family of subdomains uses its
//! own markup, so title, author, body and tag selectors are picked per
//! subdomain.

use super::{FetchContext, FetchOutcome, SourceFetcher};
use crate::error::{FetchError, SourceError};
use crate::models::{Article, DateWindow, PUBLISHER_UTC_OFFSET_SECS, Source};
use crate::utils::{HtmlFilter, html_to_markdown};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{error, info, instrument, warn};
use url::Url;

const UNWANTED_IDS: &[&str] = &[
    "billboard_article",
    "article-new-featured",
    "taboola-mid-article-thumbnails",
    "taboola-mid-article-thumbnails-stream",
    "fb-root",
];
const UNWANTED_CLASSES: &[&str] = &["ztoop", "sib-form", "cdn_newsletter"];

static CEBU_BYLINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"By:\s*(.+)").expect("hard-coded regular expression to be valid"));
static BANDERA_BYLINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([\w\s.]+)\s+-").expect("hard-coded regular expression to be valid")
});

/// Fetcher for the Inquirer daily archive.
#[derive(Debug, Clone)]
pub struct InquirerFetcher {
    pub base: String,
    /// Scheme an archive link must use to be followed.
    pub link_scheme: String,
}

impl Default for InquirerFetcher {
    fn default() -> Self {
        Self {
            base: "https://www.inquirer.net".to_string(),
            link_scheme: "https".to_string(),
        }
    }
}

/// An article link found on an archive page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLink {
    pub category: String,
    pub url: String,
}

/// Pieces of an Inquirer article URL, `https://{subdomain}.{origin}.net/{article_id}/{slug}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub subdomain: String,
    pub origin: String,
    pub article_id: String,
    pub slug: String,
}

impl UrlParts {
    pub fn parse(link: &str) -> Option<Self> {
        let url = Url::parse(link).ok()?;
        let host = url.host_str()?;
        let mut labels = host.split('.');
        let subdomain = labels.next().unwrap_or_default().to_string();
        let origin = labels.next().unwrap_or_default().to_string();
        let path = url.path().trim_matches('/');
        let (article_id, slug) = path.split_once('/').unwrap_or((path, ""));
        Some(Self {
            subdomain,
            origin,
            article_id: article_id.to_string(),
            slug: slug.to_string(),
        })
    }
}

#[async_trait]
impl SourceFetcher for InquirerFetcher {
    fn source(&self) -> Source {
        Source::Inquirer
    }

    /// One partition per archive day.
    fn partitions(&self, window: DateWindow) -> Vec<DateWindow> {
        window.days().into_iter().map(DateWindow::single).collect()
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<FetchOutcome, SourceError> {
        let mut outcome = FetchOutcome::default();
        for day in window.days() {
            if ctx.is_cancelled() {
                break;
            }
            let links = index_articles(ctx, self, day)
                .await
                .map_err(|e| SourceError::unavailable(Source::Inquirer, e))?;
            outcome.merge(fetch_articles(ctx, links, day).await);
        }
        Ok(outcome)
    }
}

/// Fetch and parse the archive page for `day`.
#[instrument(level = "info", skip(ctx, fetcher))]
pub async fn index_articles(
    ctx: &FetchContext,
    fetcher: &InquirerFetcher,
    day: NaiveDate,
) -> Result<Vec<IndexLink>, FetchError> {
    let url = format!("{}/article-index/", fetcher.base.trim_end_matches('/'));
    let body = ctx
        .get_text(&url, &[("d", day.format("%Y-%m-%d").to_string())])
        .await?;
    let links = parse_index(&body, &fetcher.link_scheme);
    info!(count = links.len(), %day, "Indexed Inquirer archive");
    Ok(links)
}

/// Extract `(category, link)` pairs from an archive page.
///
/// Links on other schemes, Cebu Daily News daily gospel pages, and repeats
/// of a link already seen are dropped.
pub fn parse_index(html: &str, scheme: &str) -> Vec<IndexLink> {
    let document = Html::parse_document(html);
    let Ok(heading) = Selector::parse("h4") else {
        return Vec::new();
    };
    let prefix = format!("{scheme}://");

    document
        .select(&heading)
        .flat_map(|h4| {
            let category = h4.text().collect::<String>().trim().to_string();
            let list = h4
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "ul");
            list.into_iter()
                .flat_map(children_named("li"))
                .flat_map(children_named("a"))
                .filter_map(|a| a.value().attr("href"))
                .map(str::trim)
                .filter(|href| href.starts_with(&prefix) && !is_daily_gospel(href))
                .map(|href| IndexLink {
                    category: category.clone(),
                    url: href.to_string(),
                })
                .collect::<Vec<_>>()
        })
        .unique_by(|link| link.url.clone())
        .collect()
}

fn children_named<'a>(name: &'static str) -> impl Fn(ElementRef<'a>) -> Vec<ElementRef<'a>> {
    move |el| {
        el.children()
            .filter_map(ElementRef::wrap)
            .filter(|child| child.value().name() == name)
            .collect()
    }
}

fn is_daily_gospel(link: &str) -> bool {
    UrlParts::parse(link)
        .is_some_and(|parts| parts.subdomain == "cebudailynews" && parts.slug.contains("daily-gospel"))
}

/// Resolve every archive link concurrently. Failed pages are logged and skipped.
#[instrument(level = "info", skip(ctx, links), fields(count = links.len()))]
pub async fn fetch_articles(ctx: &FetchContext, links: Vec<IndexLink>, day: NaiveDate) -> FetchOutcome {
    let results: Vec<Result<Article, FetchError>> = stream::iter(links)
        .map(|link| async move { fetch_article(ctx, &link, day).await })
        .buffer_unordered(ctx.concurrency())
        .collect()
        .await;

    let mut outcome = FetchOutcome::default();
    for result in results {
        match result {
            Ok(article) => outcome.articles.push(article),
            Err(e) => {
                error!(error = %e, url = %e.url(), "Inquirer fetch failed");
                outcome.failures.push(e);
            }
        }
    }
    info!(
        fetched = outcome.articles.len(),
        failed = outcome.failures.len(),
        %day,
        "Fetched Inquirer articles"
    );
    outcome
}

#[instrument(level = "debug", skip_all, fields(url = %link.url))]
async fn fetch_article(ctx: &FetchContext, link: &IndexLink, day: NaiveDate) -> Result<Article, FetchError> {
    let body = ctx.get_text(&link.url, &[]).await?;
    parse_article(&body, link, day)
}

/// Map an article page onto an [`Article`].
///
/// `date` is the archive day the link was listed under.
pub fn parse_article(html: &str, link: &IndexLink, day: NaiveDate) -> Result<Article, FetchError> {
    let parts = UrlParts::parse(&link.url).ok_or_else(|| FetchError::Parse {
        url: link.url.clone(),
        reason: "not an absolute URL".to_string(),
    })?;
    let document = Html::parse_document(html);

    let mut article = Article::new(Source::Inquirer, &link.url, day)
        .with_category(Some(link.category.clone()))
        .with_title(extract_title(&document, &parts.subdomain))
        .with_author(extract_author(&document, &parts.subdomain))
        .with_content(extract_content(&document, &parts.subdomain))
        .with_tags(extract_tags(&document, &parts.subdomain));
    article.publish_time = extract_publish_time(&document);

    if article.publish_time.is_none() {
        warn!(url = %link.url, "No parsable publish time");
    }
    Ok(article)
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    document
        .select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|text| !text.is_empty())
}

fn first_attr(document: &Html, css: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    document
        .select(&selector)
        .find_map(|el| el.value().attr(attr).map(str::to_string))
}

fn all_texts(document: &Html, css: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|text| !text.is_empty())
        .collect()
}

fn extract_title(document: &Html, subdomain: &str) -> Option<String> {
    match subdomain {
        "lifestyle" => first_text(document, "h1.elementor-heading-title"),
        "pop" => first_text(document, "div.single-post-banner-inner > h1"),
        "cebudailynews" => first_text(document, "#landing-headline h1")
            .or_else(|| first_text(document, "#art-hgroup h1")),
        "bandera" => first_text(document, "#landing-headline h1"),
        _ => first_text(document, "h1.entry-title"),
    }
}

fn extract_author(document: &Html, subdomain: &str) -> Option<String> {
    match subdomain {
        "lifestyle" => first_text(
            document,
            "div.elementor-widget-post-info ul.elementor-post-info li span.elementor-post-info__terms-list a",
        ),
        "pop" => first_text(document, "ul.blog-meta-list a[href*='/byline/']"),
        "cebudailynews" => all_texts(document, "#m-pd2 span")
            .iter()
            .find_map(|text| capture(&CEBU_BYLINE, text))
            .or_else(|| first_text(document, ".art-byline a")),
        "bandera" => all_texts(document, "#m-pd2 span")
            .iter()
            .find_map(|text| capture(&BANDERA_BYLINE, text)),
        _ => first_attr(document, "div#art_author", "data-byline-strips").or_else(|| {
            let plate = all_texts(document, "div#art_plat *");
            if plate.len() > 2 { Some(plate[1].clone()) } else { None }
        }),
    }
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

fn extract_content(document: &Html, subdomain: &str) -> Option<String> {
    let css = match subdomain {
        "lifestyle" => "div.elementor-widget-theme-post-content",
        "pop" | "bandera" => "div#TO_target_content",
        "cebudailynews" => "div#article-content",
        _ => "div#FOR_target_content",
    };
    let selector = Selector::parse(css).ok()?;
    let body = document.select(&selector).next()?;
    let filter = HtmlFilter {
        ids: UNWANTED_IDS,
        classes: UNWANTED_CLASSES,
        ..HtmlFilter::default()
    };
    Some(html_to_markdown(&body.inner_html(), &filter))
}

fn extract_tags(document: &Html, subdomain: &str) -> Vec<String> {
    let css = match subdomain {
        "pop" => "div.tags-box span.tags-links a",
        _ => "div#article_tags a",
    };
    let Ok(selector) = Selector::parse(css) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| href.split_once("/tag/").map(|(_, tag)| tag.trim_matches('/').to_string()))
        .collect()
}

/// Parse `meta[property="article:published_time"]`.
///
/// The Inquirer emits either `Sat, 19 Apr 2025 09:18:07 PST` (Philippine
/// time) or an ISO-8601 timestamp. The last parsable value wins.
fn extract_publish_time(document: &Html) -> Option<DateTime<Utc>> {
    let selector = Selector::parse(r#"meta[property="article:published_time"]"#).ok()?;
    document
        .select(&selector)
        .filter_map(|meta| meta.value().attr("content"))
        .filter_map(parse_publish_time)
        .last()
}

fn parse_publish_time(raw: &str) -> Option<DateTime<Utc>> {
    let manila = FixedOffset::east_opt(PUBLISHER_UTC_OFFSET_SECS)?;
    let raw = raw.trim();
    let weekday_form = raw
        .split_once(',')
        .is_some_and(|(head, _)| head.trim().chars().all(char::is_alphabetic));

    if weekday_form {
        let cleaned = raw.replace("PST", "");
        let naive = NaiveDateTime::parse_from_str(cleaned.trim(), "%a, %d %b %Y %H:%M:%S").ok()?;
        return manila
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()?;
    manila
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
