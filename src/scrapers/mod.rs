//! Source fetchers for the publishers the pipeline ingests.
//!
//! Each fetcher follows the same two-phase pattern:
//!
//! 1. **Indexing**: discover candidate articles for a date window through the
//!    publisher's listing mechanism
//! 2. **Resolving**: fetch each candidate's full content and map it onto an
//!    [`Article`]
//!
//! # Supported Sources
//!
//! | Source | Module | Listing | Resolution |
//! |--------|--------|---------|------------|
//! | ABS-CBN | [`abscbn`] | JSON API, offset paginated | item detail API |
//! | Manila Bulletin | [`manila_bulletin`] | JSON API, page paginated | inline body |
//! | Inquirer | [`inquirer`] | daily archive HTML | article HTML |
//!
//! # Common Patterns
//!
//! - Every network call goes through [`FetchContext`], which holds the shared
//!   HTTP client, the global in-flight ceiling, per-request timeouts, retries,
//!   and the run's cancellation token. Fetchers never limit themselves.
//! - A failed article is logged and recorded in [`FetchOutcome::failures`];
//!   the rest of the window still comes back.
//! - Failing to list anything at all is [`SourceError::Unavailable`].

use crate::error::{FetchError, SourceError};
use crate::models::{Article, DateWindow, Source};
use crate::retry::{RetryPolicy, retry_if};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub mod abscbn;
pub mod inquirer;
pub mod manila_bulletin;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; news_ingest/0.1)";

/// What one fetch of one partition produced.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub articles: Vec<Article>,
    pub failures: Vec<FetchError>,
}

impl FetchOutcome {
    pub fn merge(&mut self, other: FetchOutcome) {
        self.articles.extend(other.articles);
        self.failures.extend(other.failures);
    }
}

/// A publisher that can list articles for a date range and resolve them.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source(&self) -> Source;

    /// Split `window` into independently fetchable partitions.
    ///
    /// Defaults to one partition for the whole window.
    fn partitions(&self, window: DateWindow) -> Vec<DateWindow> {
        vec![window]
    }

    /// Fetch every article published inside `window`.
    async fn fetch(
        &self,
        ctx: &FetchContext,
        window: DateWindow,
    ) -> Result<FetchOutcome, SourceError>;
}

/// Build the production fetcher for each requested source.
pub fn fetchers_for(sources: &[Source]) -> Vec<Arc<dyn SourceFetcher>> {
    sources
        .iter()
        .map(|source| -> Arc<dyn SourceFetcher> {
            match source {
                Source::AbsCbn => Arc::new(abscbn::AbsCbnFetcher::default()),
                Source::ManilaBulletin => Arc::new(manila_bulletin::ManilaBulletinFetcher::default()),
                Source::Inquirer => Arc::new(inquirer::InquirerFetcher::default()),
            }
        })
        .collect()
}

/// Shared network plumbing handed to every fetcher.
///
/// Cloning is cheap; all clones share the same client, semaphore, and
/// counters.
#[derive(Clone)]
pub struct FetchContext {
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    ceiling: usize,
    cancel: CancellationToken,
    timeout: Duration,
    retry: RetryPolicy,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl FetchContext {
    pub fn new(
        concurrency: usize,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            limiter: Arc::new(Semaphore::new(concurrency)),
            ceiling: concurrency,
            cancel,
            timeout,
            retry: RetryPolicy::new(2, Duration::from_millis(500)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Maximum number of requests in flight at once.
    pub fn concurrency(&self) -> usize {
        self.ceiling
    }

    /// Highest number of requests observed in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// GET `url` and return the body as text.
    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        let label = url.to_string();
        retry_if(
            &self.retry,
            &label,
            || self.get_once(url, query),
            is_transient,
        )
        .await
        .map(|(body, _)| body)
        .map_err(|exhausted| exhausted.error)
    }

    /// GET `url` and decode the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let body = self.get_text(url, query).await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn get_once(&self, url: &str, query: &[(&str, String)]) -> Result<String, FetchError> {
        let cancelled = || FetchError::Cancelled { url: url.to_string() };
        if self.cancel.is_cancelled() {
            return Err(cancelled());
        }

        let _permit = tokio::select! {
            permit = self.limiter.acquire() => permit.map_err(|_| cancelled())?,
            _ = self.cancel.cancelled() => return Err(cancelled()),
        };
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);

        let request = async {
            let response = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|source| FetchError::Http {
                    url: url.to_string(),
                    source,
                })?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            response.text().await.map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            })
        };

        let body = match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };
        debug!(bytes = body.len(), "Fetched");
        Ok(body)
    }
}

fn is_transient(e: &FetchError) -> bool {
    match e {
        FetchError::Timeout { .. } => true,
        FetchError::Http { source, .. } => source.is_timeout() || source.is_connect() || source.is_request(),
        FetchError::Status { status, .. } => *status == 429 || *status >= 500,
        FetchError::Parse { .. } | FetchError::Cancelled { .. } => false,
    }
}

/// Counts a request as in flight until dropped.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx(concurrency: usize) -> FetchContext {
        FetchContext::new(concurrency, Duration::from_secs(5), CancellationToken::new())
            .unwrap()
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_get_json_decodes_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok": true}"#))
            .mount(&server)
            .await;

        let value: serde_json::Value = ctx(2)
            .get_json(&format!("{}/feed", server.uri()), &[])
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = ctx(2)
            .get_text(&format!("{}/missing", server.uri()), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_transient_status_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let body = ctx(1)
            .with_retry(RetryPolicy::new(1, Duration::from_millis(1)).without_jitter())
            .get_text(&server.uri(), &[])
            .await
            .unwrap();
        assert_eq!(body, "recovered");
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let ctx = FetchContext::new(1, Duration::from_millis(50), CancellationToken::new())
            .unwrap()
            .with_retry(RetryPolicy::new(0, Duration::from_millis(1)));
        let err = ctx.get_text(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Timeout { .. } | FetchError::Http { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancelled_context_issues_no_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = ctx(2);
        ctx.cancel_token().cancel();
        let err = ctx.get_text(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_ceiling_bounds_in_flight_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(50)))
            .mount(&server)
            .await;

        let ctx = ctx(3);
        let url = server.uri();
        let requests = (0..12).map(|_| ctx.get_text(&url, &[]));
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(Result::is_ok));
        assert!(ctx.peak_in_flight() <= 3);
        assert!(ctx.peak_in_flight() >= 1);
    }
}
