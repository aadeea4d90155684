//! Data models shared by every fetcher and storage backend.
//!
//! This module defines:
//! - [`Article`]: the canonical record every publisher payload is mapped into
//! - [`Source`]: the publishers the pipeline knows how to fetch
//! - [`DateWindow`]: an inclusive range of publication days
//!
//! Records are immutable once built. The `id` is derived from the URL alone,
//! so the same URL always produces the same row key no matter which fetcher
//! produced it.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Offset of Philippine Standard Time, the calendar all three publishers use.
pub const PUBLISHER_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Publishers the pipeline can fetch from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    AbsCbn,
    ManilaBulletin,
    Inquirer,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::AbsCbn, Source::ManilaBulletin, Source::Inquirer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::AbsCbn => "abs-cbn",
            Source::ManilaBulletin => "manila-bulletin",
            Source::Inquirer => "inquirer",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = crate::error::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "abs-cbn" | "abscbn" => Ok(Source::AbsCbn),
            "manila-bulletin" | "mb" => Ok(Source::ManilaBulletin),
            "inquirer" => Ok(Source::Inquirer),
            _ => Err(crate::error::ConfigError::UnknownSource(s.to_string())),
        }
    }
}

/// One news article in canonical form.
///
/// Field names match the columns of the raw `articles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    /// SHA-256 of the canonical URL, lower-case hex.
    pub id: String,
    pub source: Source,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    /// Publication day in Philippine time.
    pub date: NaiveDate,
    /// Publication instant, stored in UTC.
    pub publish_time: Option<DateTime<Utc>>,
    /// Body converted to markdown.
    pub content: Option<String>,
    /// Normalized tags, in publisher order.
    pub tags: Vec<String>,
}

impl Article {
    /// Start a record for `url`, deriving its id.
    pub fn new(source: Source, url: &str, date: NaiveDate) -> Self {
        Self {
            id: article_id(url),
            source,
            url: Some(url.to_string()),
            title: None,
            author: None,
            category: None,
            date,
            publish_time: None,
            content: None,
            tags: Vec::new(),
        }
    }

    /// Set the publish instant and derive `date` from it.
    pub fn published_at(mut self, at: DateTime<Utc>) -> Self {
        self.date = publisher_date(at);
        self.publish_time = Some(at);
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = non_empty(title);
        self
    }

    pub fn with_author(mut self, author: Option<String>) -> Self {
        self.author = non_empty(author);
        self
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = non_empty(category);
        self
    }

    pub fn with_content(mut self, content: Option<String>) -> Self {
        self.content = non_empty(content);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    /// Tags as stored at rest: comma-separated, no spaces.
    pub fn tags_csv(&self) -> Option<String> {
        if self.tags.is_empty() {
            None
        } else {
            Some(self.tags.join(","))
        }
    }

    /// `publish_time` as `YYYY-MM-DD HH:MM:SS`, the form every backend can cast to a timestamp.
    pub fn publish_time_sql(&self) -> Option<String> {
        self.publish_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Derive a record id from a URL.
///
/// The URL is canonicalized first (parsed, fragment dropped) so trivial
/// spelling differences such as host case do not produce different ids.
pub fn article_id(url: &str) -> String {
    let trimmed = url.trim();
    let canonical = match Url::parse(trimmed) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => trimmed.to_string(),
    };
    let digest = Sha256::digest(canonical.as_bytes());
    format!("{:x}", digest)
}

/// Normalize one tag: trimmed, lower-cased, with whitespace, underscores and
/// commas collapsed into `-`.
///
/// Commas are folded so a normalized tag never splits when the list is
/// stored comma-separated.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || matches!(c, '_' | '-' | ','))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Normalize a list of tags, dropping empties and keeping order.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| normalize_tag(t.as_ref()))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Split a comma-separated tag column back into normalized tags.
pub fn split_tags(csv: &str) -> Vec<String> {
    normalize_tags(csv.split(','))
}

/// The publisher-calendar day of an instant.
pub fn publisher_date(at: DateTime<Utc>) -> NaiveDate {
    match FixedOffset::east_opt(PUBLISHER_UTC_OFFSET_SECS) {
        Some(offset) => at.with_timezone(&offset).date_naive(),
        None => at.date_naive(),
    }
}

/// An inclusive range of publication days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    /// Every day in the window, oldest first.
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut current = self.start;
        while current <= self.end {
            days.push(current);
            current += Duration::days(1);
        }
        days
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_article_id_is_deterministic() {
        let url = "https://newsinfo.inquirer.net/2048/some-story";
        assert_eq!(article_id(url), article_id(url));
        assert_eq!(article_id(url).len(), 64);
    }

    #[test]
    fn test_article_id_ignores_fragment_and_host_case() {
        assert_eq!(
            article_id("https://www.ABS-CBN.com/news/story#comments"),
            article_id("https://www.abs-cbn.com/news/story")
        );
    }

    #[test]
    fn test_article_id_no_collisions_in_sample() {
        let ids: HashSet<String> = (0..5_000)
            .map(|i| article_id(&format!("https://mb.com.ph/2025/04/{:02}/story-{i}", i % 28 + 1)))
            .collect();
        assert_eq!(ids.len(), 5_000);
    }

    #[test]
    fn test_same_url_from_different_sources_shares_id() {
        let url = "https://www.abs-cbn.com/news/nation/2025/4/25/story";
        let a = Article::new(Source::AbsCbn, url, day("2025-04-25"));
        let b = Article::new(Source::Inquirer, url, day("2025-04-25"));
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("  Rodrigo Duterte "), "rodrigo-duterte");
        assert_eq!(normalize_tag("West_Philippine  Sea"), "west-philippine-sea");
        assert_eq!(normalize_tag("ELECTIONS--2025"), "elections-2025");
        assert_eq!(normalize_tag("   "), "");
    }

    #[test]
    fn test_tags_roundtrip_through_csv() {
        let article = Article::new(Source::Inquirer, "https://x.inquirer.net/1/a", day("2025-04-25"))
            .with_tags(["Senate", "", "Bong Go", "budget_2025"]);
        assert_eq!(article.tags, vec!["senate", "bong-go", "budget-2025"]);
        assert_eq!(article.tags_csv().as_deref(), Some("senate,bong-go,budget-2025"));
        assert_eq!(split_tags("senate, Bong Go ,budget-2025"), article.tags);
    }

    #[test]
    fn test_tag_with_comma_survives_csv() {
        assert_eq!(normalize_tag("Metro, Manila"), "metro-manila");
        let article = Article::new(Source::AbsCbn, "https://www.abs-cbn.com/a", day("2025-04-25"))
            .with_tags(["Metro, Manila", "traffic"]);
        assert_eq!(article.tags, vec!["metro-manila", "traffic"]);
        let stored = article.tags_csv().unwrap();
        assert_eq!(split_tags(&stored), article.tags);
    }

    #[test]
    fn test_empty_tags_store_as_null() {
        let article = Article::new(Source::AbsCbn, "https://www.abs-cbn.com/a", day("2025-04-25"));
        assert_eq!(article.tags_csv(), None);
    }

    #[test]
    fn test_published_at_uses_publisher_calendar() {
        // 2025-04-24 20:30 UTC is already the 25th in Manila.
        let at = Utc.with_ymd_and_hms(2025, 4, 24, 20, 30, 0).unwrap();
        let article = Article::new(Source::ManilaBulletin, "https://mb.com.ph/a", day("2000-01-01"))
            .published_at(at);
        assert_eq!(article.date, day("2025-04-25"));
        assert_eq!(article.publish_time_sql().as_deref(), Some("2025-04-24 20:30:00"));
    }

    #[test]
    fn test_blank_fields_become_none() {
        let article = Article::new(Source::AbsCbn, "https://www.abs-cbn.com/a", day("2025-04-25"))
            .with_title(Some("  ".to_string()))
            .with_author(Some(" Jane Doe ".to_string()));
        assert_eq!(article.title, None);
        assert_eq!(article.author.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("ABS-CBN".parse::<Source>().unwrap(), Source::AbsCbn);
        assert_eq!("manila_bulletin".parse::<Source>().unwrap(), Source::ManilaBulletin);
        assert_eq!("inquirer".parse::<Source>().unwrap(), Source::Inquirer);
        assert!("rappler".parse::<Source>().is_err());
    }

    #[test]
    fn test_source_serializes_kebab_case() {
        let json = serde_json::to_string(&Source::ManilaBulletin).unwrap();
        assert_eq!(json, "\"manila-bulletin\"");
    }

    #[test]
    fn test_date_window_days() {
        let window = DateWindow::new(day("2025-04-29"), day("2025-05-02"));
        let days = window.days();
        assert_eq!(days.len(), 4);
        assert_eq!(days[0], day("2025-04-29"));
        assert_eq!(days[3], day("2025-05-02"));
        assert!(window.contains(day("2025-05-01")));
        assert!(!window.contains(day("2025-05-03")));
    }
}
