//! Manila Bulletin fetcher.
//!
//! Manila Bulletin publishes through a Strapi-style CMS. One paged JSON
//! endpoint returns complete articles (body included) sorted newest first,
//! so no second request per article is needed.
//!
//! The public URL is built from the creation day and slug:
//! `https://mb.com.ph/2025/04/25/some-slug`. Filtering uses `publishedAt`,
//! which can be later than `createdAt` for drafts.

use super::{FetchContext, FetchOutcome, SourceFetcher};
use crate::error::{FetchError, SourceError};
use crate::models::{Article, DateWindow, Source, publisher_date};
use crate::utils::{HtmlFilter, html_to_markdown};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

const UNWANTED_TAGS: &[&str] = &["img", "figure", "iframe"];

/// Fetcher for the Manila Bulletin articles API.
#[derive(Debug, Clone)]
pub struct ManilaBulletinFetcher {
    pub api_base: String,
    pub site_base: String,
    pub page_size: usize,
}

impl Default for ManilaBulletinFetcher {
    fn default() -> Self {
        Self {
            api_base: "https://admin.mb.com.ph".to_string(),
            site_base: "https://mb.com.ph".to_string(),
            page_size: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    data: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    attributes: Attributes,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Attributes {
    title: Option<String>,
    slug: Option<String>,
    body: Option<String>,
    published_at: Option<String>,
    created_at: Option<String>,
    #[serde(rename = "category_primary", default)]
    category_primary: Relation<Named>,
    #[serde(default)]
    author: Relation<Named>,
    #[serde(default)]
    tags: Relation<Vec<RelationItem>>,
}

/// Strapi wraps every relation in `{ "data": ... }`, which is `null` when unset.
#[derive(Debug, Deserialize)]
struct Relation<T> {
    data: Option<T>,
}

impl<T> Default for Relation<T> {
    fn default() -> Self {
        Self { data: None }
    }
}

#[derive(Debug, Deserialize)]
struct Named {
    #[serde(default)]
    attributes: NamedAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct NamedAttributes {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RelationItem {
    #[serde(default)]
    attributes: TagAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct TagAttributes {
    slug: Option<String>,
    name: Option<String>,
}

#[async_trait]
impl SourceFetcher for ManilaBulletinFetcher {
    fn source(&self) -> Source {
        Source::ManilaBulletin
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<FetchOutcome, SourceError> {
        fetch_articles(ctx, self, window)
            .await
            .map_err(|e| SourceError::unavailable(Source::ManilaBulletin, e))
    }
}

/// Walk the pages newest first, keeping articles published inside `window`.
///
/// Stops at the first article older than `window.start`, at an empty page,
/// or at a page that fails after the first one.
#[instrument(level = "info", skip(ctx, fetcher))]
pub async fn fetch_articles(
    ctx: &FetchContext,
    fetcher: &ManilaBulletinFetcher,
    window: DateWindow,
) -> Result<FetchOutcome, FetchError> {
    let url = format!("{}/api/articles", fetcher.api_base.trim_end_matches('/'));
    let mut outcome = FetchOutcome::default();
    let mut page_number = 1usize;

    'pages: loop {
        if ctx.is_cancelled() {
            break;
        }
        let query = [
            ("pagination[pageSize]", fetcher.page_size.to_string()),
            ("pagination[page]", page_number.to_string()),
            ("sort[0]", "publishedAt:desc".to_string()),
            ("populate", "*".to_string()),
        ];
        let page: Page = match ctx.get_json(&url, &query).await {
            Ok(page) => page,
            Err(e) if page_number == 1 => return Err(e),
            Err(e) => {
                warn!(error = %e, page = page_number, "Manila Bulletin page failed; stopping pagination");
                outcome.failures.push(e);
                break;
            }
        };
        info!(count = page.data.len(), page = page_number, "Fetched Manila Bulletin page");

        if page.data.is_empty() {
            debug!("No more articles found");
            break;
        }

        for entry in page.data {
            match to_article(&fetcher.site_base, entry.attributes) {
                Ok(article) => {
                    if article.date < window.start {
                        debug!("Reached articles older than the window start");
                        break 'pages;
                    }
                    if article.date <= window.end {
                        outcome.articles.push(article);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Skipping malformed Manila Bulletin article");
                    outcome.failures.push(e);
                }
            }
        }
        page_number += 1;
    }

    info!(
        fetched = outcome.articles.len(),
        failed = outcome.failures.len(),
        "Fetched Manila Bulletin articles"
    );
    Ok(outcome)
}

fn to_article(site_base: &str, attrs: Attributes) -> Result<Article, FetchError> {
    let slug = attrs.slug.as_deref().map(str::trim).unwrap_or_default();
    let label = format!("{}/{}", site_base, slug);
    let parse_err = |reason: String| FetchError::Parse {
        url: label.clone(),
        reason,
    };

    if slug.is_empty() {
        return Err(parse_err("article has no slug".to_string()));
    }
    let published = parse_timestamp(attrs.published_at.as_deref())
        .map_err(|r| parse_err(format!("publishedAt: {r}")))?;
    let created = parse_timestamp(attrs.created_at.as_deref())
        .map_err(|r| parse_err(format!("createdAt: {r}")))?;

    let url = format!(
        "{}/{}/{}",
        site_base.trim_end_matches('/'),
        publisher_date(created).format("%Y/%m/%d"),
        slug
    );
    let category = attrs
        .category_primary
        .data
        .and_then(|c| c.attributes.name)
        .map(|name| name.to_uppercase());
    let author = attrs.author.data.and_then(|a| a.attributes.name);
    let tags = attrs
        .tags
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|t| t.attributes.slug.or(t.attributes.name));
    let content = attrs.body.map(|html| {
        html_to_markdown(
            &html,
            &HtmlFilter {
                tags: UNWANTED_TAGS,
                ..HtmlFilter::default()
            },
        )
    });

    Ok(Article::new(Source::ManilaBulletin, &url, published.date_naive())
        .published_at(published)
        .with_title(attrs.title)
        .with_author(author)
        .with_category(category)
        .with_content(content)
        .with_tags(tags))
}

fn parse_timestamp(raw: Option<&str>) -> Result<DateTime<Utc>, String> {
    let raw = raw.ok_or_else(|| "missing".to_string())?;
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("{raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> FetchContext {
        FetchContext::new(4, Duration::from_secs(5), CancellationToken::new())
            .unwrap()
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1)))
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, d).unwrap()
    }

    fn entry(slug: &str, published: &str, created: &str) -> serde_json::Value {
        json!({
            "id": 1,
            "attributes": {
                "title": format!("Title {slug}"),
                "slug": slug,
                "body": "<p>Body text</p><figure><img src='a.jpg'></figure>",
                "publishedAt": published,
                "createdAt": created,
                "category_primary": {"data": {"attributes": {"name": "Business"}}},
                "author": {"data": {"attributes": {"name": "Juan Dela Cruz"}}},
                "tags": {"data": [
                    {"attributes": {"slug": "stock-market"}},
                    {"attributes": {"slug": "PSEi"}}
                ]}
            }
        })
    }

    fn fetcher(server: &MockServer) -> ManilaBulletinFetcher {
        ManilaBulletinFetcher {
            api_base: server.uri(),
            ..ManilaBulletinFetcher::default()
        }
    }

    #[test]
    fn test_null_relations_deserialize() {
        let raw = json!({
            "title": "t",
            "slug": "s",
            "publishedAt": "2025-04-25T01:00:00.000Z",
            "createdAt": "2025-04-25T01:00:00.000Z",
            "category_primary": {"data": null},
            "author": {"data": null},
            "tags": {"data": []}
        });
        let attrs: Attributes = serde_json::from_value(raw).unwrap();
        let article = to_article("https://mb.com.ph", attrs).unwrap();
        assert_eq!(article.author, None);
        assert_eq!(article.category, None);
        assert!(article.tags.is_empty());
        assert_eq!(article.url.as_deref(), Some("https://mb.com.ph/2025/04/25/s"));
    }

    #[test]
    fn test_missing_slug_is_parse_error() {
        let attrs = Attributes {
            published_at: Some("2025-04-25T01:00:00.000Z".to_string()),
            created_at: Some("2025-04-25T01:00:00.000Z".to_string()),
            ..Attributes::default()
        };
        let err = to_article("https://mb.com.ph", attrs).unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_pages_until_older_than_window() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/articles"))
            .and(query_param("pagination[page]", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    entry("too-new", "2025-04-28T02:00:00.000Z", "2025-04-28T01:00:00.000Z"),
                    entry("peso-rally", "2025-04-26T02:00:00.000Z", "2025-04-25T23:00:00.000Z"),
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/articles"))
            .and(query_param("pagination[page]", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    entry("rate-cut", "2025-04-25T05:00:00.000Z", "2025-04-25T04:00:00.000Z"),
                    entry("stale", "2025-04-20T05:00:00.000Z", "2025-04-20T04:00:00.000Z"),
                    entry("never-seen", "2025-04-19T05:00:00.000Z", "2025-04-19T04:00:00.000Z"),
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/articles"))
            .and(query_param("pagination[page]", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(0)
            .mount(&server)
            .await;

        let outcome = fetcher(&server)
            .fetch(&ctx(), DateWindow::new(day(25), day(26)))
            .await
            .unwrap();

        let slugs: Vec<_> = outcome
            .articles
            .iter()
            .filter_map(|a| a.url.as_deref())
            .collect();
        assert_eq!(
            slugs,
            vec![
                "https://mb.com.ph/2025/04/26/peso-rally",
                "https://mb.com.ph/2025/04/25/rate-cut",
            ]
        );
        let first = &outcome.articles[0];
        assert_eq!(first.category.as_deref(), Some("BUSINESS"));
        assert_eq!(first.author.as_deref(), Some("Juan Dela Cruz"));
        assert_eq!(first.tags, vec!["stock-market", "psei"]);
        assert_eq!(first.content.as_deref(), Some("Body text"));
        assert_eq!(first.date, day(26));
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_first_page_failure_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch(&ctx(), DateWindow::single(day(25)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SourceError::Unavailable { source_id: Source::ManilaBulletin, .. }
        ));
    }

    #[tokio::test]
    async fn test_later_page_failure_keeps_earlier_articles() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("pagination[page]", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [entry("kept", "2025-04-25T05:00:00.000Z", "2025-04-25T04:00:00.000Z")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("pagination[page]", "2"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let outcome = fetcher(&server)
            .fetch(&ctx(), DateWindow::single(day(25)))
            .await
            .unwrap();
        assert_eq!(outcome.articles.len(), 1);
        assert_eq!(outcome.failures.len(), 1);
    }
}
