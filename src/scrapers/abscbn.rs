//! ABS-CBN News fetcher.
//!
//! ABS-CBN exposes a content API that lists the newest items first. The
//! listing is paged with `limit`/`offset`; each entry carries its metadata
//! and a `slugline_url`, which resolves to the full body through a second
//! item endpoint.
//!
//! # URL Pattern
//!
//! Canonical article URLs look like
//! `https://www.abs-cbn.com/news/nation/2025/4/25/some-story-1234`.

use super::{FetchContext, FetchOutcome, SourceFetcher};
use crate::error::{FetchError, SourceError};
use crate::models::{Article, DateWindow, Source, publisher_date, split_tags};
use crate::utils::{HtmlFilter, html_to_markdown};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

const UNWANTED_TAGS: &[&str] = &["img", "figure", "iframe"];

/// Fetcher for the ABS-CBN content API.
#[derive(Debug, Clone)]
pub struct AbsCbnFetcher {
    pub api_base: String,
    pub site_base: String,
    pub page_size: usize,
}

impl Default for AbsCbnFetcher {
    fn default() -> Self {
        Self {
            api_base: "https://od2-content-api.abs-cbn.com".to_string(),
            site_base: "https://www.abs-cbn.com".to_string(),
            page_size: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListPage {
    #[serde(rename = "listItem", default)]
    list_item: Vec<ListItem>,
}

/// One entry of the `latest` listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ListItem {
    pub slugline_url: Option<String>,
    pub category: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    #[serde(rename = "createdDateFull")]
    pub created: Option<String>,
    #[serde(default)]
    pub tags: Value,
}

#[derive(Debug, Deserialize)]
struct ItemDetail {
    data: Option<ItemData>,
}

#[derive(Debug, Deserialize)]
struct ItemData {
    body_html: Option<String>,
}

#[async_trait]
impl SourceFetcher for AbsCbnFetcher {
    fn source(&self) -> Source {
        Source::AbsCbn
    }

    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<FetchOutcome, SourceError> {
        let (items, mut failures) = index_articles(ctx, &self.api_base, window, self.page_size)
            .await
            .map_err(|e| SourceError::unavailable(Source::AbsCbn, e))?;
        let mut outcome = fetch_articles(ctx, &self.api_base, &self.site_base, items).await;
        failures.append(&mut outcome.failures);
        outcome.failures = failures;
        Ok(outcome)
    }
}

/// Page through the `latest` listing until items older than the window appear.
///
/// Returns the in-window items with their parsed creation time, plus any
/// non-fatal failures. Only a failure on the very first page is an error.
#[instrument(level = "info", skip(ctx))]
pub async fn index_articles(
    ctx: &FetchContext,
    api_base: &str,
    window: DateWindow,
    page_size: usize,
) -> Result<(Vec<(ListItem, DateTime<Utc>)>, Vec<FetchError>), FetchError> {
    let url = format!("{}/prod/latest", api_base.trim_end_matches('/'));
    let mut offset = 0usize;
    let mut selected = Vec::new();
    let mut failures = Vec::new();

    loop {
        if ctx.is_cancelled() {
            break;
        }
        let query = [
            ("sectionId", "news".to_string()),
            ("brand", "OD".to_string()),
            ("partner", "imp-01".to_string()),
            ("limit", page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        let page: ListPage = match ctx.get_json(&url, &query).await {
            Ok(page) => page,
            Err(e) if offset == 0 => return Err(e),
            Err(e) => {
                warn!(error = %e, offset, "ABS-CBN listing page failed; stopping pagination");
                failures.push(e);
                break;
            }
        };
        info!(count = page.list_item.len(), offset, "Fetched ABS-CBN listing page");

        if page.list_item.is_empty() {
            break;
        }
        let page_len = page.list_item.len();
        let mut reached_older = false;

        for item in page.list_item {
            let parsed = match item.created.as_deref() {
                Some(raw) => parse_created(raw),
                None => Err("missing createdDateFull".to_string()),
            };
            let created = match parsed {
                Ok(created) => created,
                Err(reason) => {
                    failures.push(FetchError::Parse {
                        url: item.slugline_url.clone().unwrap_or_default(),
                        reason,
                    });
                    continue;
                }
            };
            let day = publisher_date(created);
            if day < window.start {
                reached_older = true;
                break;
            }
            if day > window.end || item.slugline_url.is_none() {
                continue;
            }
            selected.push((item, created));
        }

        if reached_older {
            debug!("Reached articles older than the window start");
            break;
        }
        if page_len < page_size {
            break;
        }
        offset += page_size;
    }

    info!(count = selected.len(), "Indexed ABS-CBN articles");
    Ok((selected, failures))
}

/// Resolve every listed item concurrently. Failed items are logged and skipped.
#[instrument(level = "info", skip_all)]
pub async fn fetch_articles(
    ctx: &FetchContext,
    api_base: &str,
    site_base: &str,
    items: Vec<(ListItem, DateTime<Utc>)>,
) -> FetchOutcome {
    let results: Vec<Result<Article, FetchError>> = stream::iter(items)
        .map(|(item, created)| async move {
            fetch_article(ctx, api_base, site_base, &item, created).await
        })
        .buffer_unordered(ctx.concurrency())
        .collect()
        .await;

    let mut outcome = FetchOutcome::default();
    for result in results {
        match result {
            Ok(article) => outcome.articles.push(article),
            Err(e) => {
                error!(error = %e, url = %e.url(), "ABS-CBN fetch failed");
                outcome.failures.push(e);
            }
        }
    }
    info!(
        fetched = outcome.articles.len(),
        failed = outcome.failures.len(),
        "Fetched ABS-CBN article contents"
    );
    outcome
}

/// Fetch a single ABS-CBN item and map it onto an [`Article`].
#[instrument(level = "debug", skip_all, fields(slug = ?item.slugline_url))]
async fn fetch_article(
    ctx: &FetchContext,
    api_base: &str,
    site_base: &str,
    item: &ListItem,
    created: DateTime<Utc>,
) -> Result<Article, FetchError> {
    let slug = item.slugline_url.as_deref().unwrap_or_default().trim_start_matches('/');
    let detail_url = format!(
        "{}/prod/item?url={}",
        api_base.trim_end_matches('/'),
        urlencoding::encode(slug)
    );
    let detail: ItemDetail = ctx.get_json(&detail_url, &[]).await?;
    let content = detail
        .data
        .and_then(|d| d.body_html)
        .map(|html| {
            html_to_markdown(
                &html,
                &HtmlFilter {
                    tags: UNWANTED_TAGS,
                    ..HtmlFilter::default()
                },
            )
        });

    let url = format!("{}/{}", site_base.trim_end_matches('/'), slug);
    Ok(Article::new(Source::AbsCbn, &url, created.date_naive())
        .published_at(created)
        .with_title(item.title.clone())
        .with_author(item.author.clone())
        .with_category(item.category.as_ref().map(|c| c.to_uppercase()))
        .with_content(content)
        .with_tags(tags_from_value(&item.tags)))
}

fn parse_created(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%SZ")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw.trim()).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| format!("bad createdDateFull {raw:?}: {e}"))
}

/// ABS-CBN sends tags either as a comma-separated string or as an array.
fn tags_from_value(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => split_tags(s),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => map
                    .get("name")
                    .or_else(|| map.get("slug"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use chrono::NaiveDate;
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

    fn listing() -> serde_json::Value {
        serde_json::json!({
            "listItem": [
                {
                    "_id": "a1",
                    "slugline_url": "news/nation/2025/4/27/newest",
                    "category": "nation",
                    "title": "Too new",
                    "author": "Reporter",
                    "createdDateFull": "2025-04-27T02:00:00Z",
                    "tags": "x"
                },
                {
                    "_id": "a2",
                    "slugline_url": "news/nation/2025/4/26/senate-vote",
                    "category": "nation",
                    "title": "Senate vote",
                    "author": "Jane Doe",
                    "createdDateFull": "2025-04-26T01:30:00Z",
                    "tags": "Senate, Budget_2025"
                },
                {
                    "_id": "a3",
                    "slugline_url": "news/business/2025/4/25/peso",
                    "category": "business",
                    "title": "Peso closes higher",
                    "author": null,
                    "createdDateFull": "2025-04-25T03:00:00Z",
                    "tags": ["Peso", "Forex"]
                },
                {
                    "_id": "a4",
                    "slugline_url": "news/old",
                    "category": "nation",
                    "title": "Too old",
                    "createdDateFull": "2025-04-20T03:00:00Z"
                }
            ]
        })
    }

    #[test]
    fn test_tags_from_value_shapes() {
        assert_eq!(tags_from_value(&serde_json::json!("Senate, Bong Go")), vec!["senate", "bong-go"]);
        assert_eq!(
            tags_from_value(&serde_json::json!(["a", {"name": "b"}, 3])),
            vec!["a", "b"]
        );
        assert!(tags_from_value(&Value::Null).is_empty());
    }

    #[test]
    fn test_parse_created() {
        let parsed = parse_created("2025-04-26T01:30:00Z").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-04-26T01:30:00+00:00");
        assert!(parse_created("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_fetch_window_from_listing_and_details() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prod/latest"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/prod/item"))
            .and(query_param("url", "news/nation/2025/4/26/senate-vote"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"body_html": "<p>The Senate voted.</p><img src='x.jpg'>"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/prod/item"))
            .and(query_param("url", "news/business/2025/4/25/peso"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let fetcher = AbsCbnFetcher {
            api_base: server.uri(),
            site_base: "https://www.abs-cbn.com".to_string(),
            page_size: 1000,
        };
        let outcome = fetcher
            .fetch(&ctx(), DateWindow::new(day(25), day(26)))
            .await
            .unwrap();

        assert_eq!(outcome.articles.len(), 1);
        assert_eq!(outcome.failures.len(), 1);

        let article = &outcome.articles[0];
        assert_eq!(article.source, Source::AbsCbn);
        assert_eq!(
            article.url.as_deref(),
            Some("https://www.abs-cbn.com/news/nation/2025/4/26/senate-vote")
        );
        assert_eq!(article.id, crate::models::article_id("https://www.abs-cbn.com/news/nation/2025/4/26/senate-vote"));
        assert_eq!(article.category.as_deref(), Some("NATION"));
        assert_eq!(article.content.as_deref(), Some("The Senate voted."));
        assert_eq!(article.tags, vec!["senate", "budget-2025"]);
        assert_eq!(article.date, day(26));
    }

    #[tokio::test]
    async fn test_listing_failure_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let fetcher = AbsCbnFetcher {
            api_base: server.uri(),
            ..AbsCbnFetcher::default()
        };
        let err = fetcher
            .fetch(&ctx(), DateWindow::single(day(25)))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { source_id: Source::AbsCbn, .. }));
    }
}
