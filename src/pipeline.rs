//! Pipeline driver: fetch, buffer, write, summarize.
//!
//! [`run`] owns the backend handle for the whole run. It opens the handle,
//! streams the orchestrator's records through a [`BatchWriter`], runs the
//! optional export, and closes the handle on every path out. Only a bad
//! configuration or a backend that cannot be opened ends a run early; every
//! other failure lands in the [`RunSummary`].
//!
//! Records of batches that failed after their retry are also written to a
//! JSON Lines file under `failed_batch_dir`, one record per line, so they
//! outlive the process and can be replayed.

use crate::config::Config;
use crate::error::{BatchWriteError, PipelineError};
use crate::models::{Article, Source};
use crate::orchestrator::{FetchOrchestrator, FetchReport};
use crate::scrapers::{self, FetchContext, SourceFetcher};
use crate::storage::{self, StorageBackend};
use crate::writer::{BatchWriter, FlushReport};
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// What one run did.
#[derive(Debug)]
pub struct RunSummary {
    pub backend: &'static str,
    pub records_seen: usize,
    pub inserted: usize,
    pub rejected: usize,
    pub failed_fetches: usize,
    pub unavailable_sources: Vec<Source>,
    pub failed_batches: Vec<BatchWriteError>,
    /// JSON Lines file holding the records of `failed_batches`.
    pub failed_batches_path: Option<PathBuf>,
    pub cancelled: bool,
    pub exported_rows: Option<u64>,
    pub fetch: FetchReport,
    pub elapsed: Duration,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "RUN SUMMARY ({})", self.backend)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Records seen:         {}", self.records_seen)?;
        writeln!(f, "Records inserted:     {}", self.inserted)?;
        writeln!(f, "Records rejected:     {}", self.rejected)?;
        writeln!(f, "Failed fetches:       {}", self.failed_fetches)?;
        writeln!(f, "Failed batches:       {}", self.failed_batches.len())?;
        if let Some(path) = &self.failed_batches_path {
            writeln!(f, "Failed records saved: {}", path.display())?;
        }
        if !self.unavailable_sources.is_empty() {
            let names: Vec<&str> = self.unavailable_sources.iter().map(Source::as_str).collect();
            writeln!(f, "Unavailable sources:  {}", names.join(", "))?;
        }
        if self.cancelled {
            writeln!(f, "Cancelled:            yes")?;
        }
        if let Some(rows) = self.exported_rows {
            writeln!(f, "Exported rows:        {rows}")?;
        }
        writeln!(f, "Elapsed:              {:.1}s", self.elapsed.as_secs_f64())?;
        write!(f, "{}", self.fetch)?;
        write!(f, "{rule}")
    }
}

/// One line of a failed-batch file.
#[derive(Serialize)]
struct FailedRecord<'a> {
    batch: usize,
    attempts: usize,
    error: &'a str,
    record: &'a Article,
}

/// Write the records of `batches` to a new JSON Lines file under `dir`.
#[instrument(level = "info", skip_all, fields(dir = %dir.display(), %backend, batches = batches.len()))]
pub async fn save_failed_batches(
    dir: &Path,
    backend: &str,
    batches: &[BatchWriteError],
) -> std::io::Result<PathBuf> {
    let mut lines = String::new();
    for (batch, failed) in batches.iter().enumerate() {
        for record in &failed.records {
            let line = serde_json::to_string(&FailedRecord {
                batch,
                attempts: failed.attempts,
                error: &failed.message,
                record,
            })?;
            lines.push_str(&line);
            lines.push('\n');
        }
    }

    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!(
        "{backend}-{}.jsonl",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    tokio::fs::write(&path, lines).await?;
    info!(path = %path.display(), "Saved records of failed batches");
    Ok(path)
}

/// Run the pipeline described by `config` against the production fetchers.
pub async fn run(config: &Config, cancel: CancellationToken) -> Result<RunSummary, PipelineError> {
    let ctx = FetchContext::new(config.concurrency, config.request_timeout, cancel)?;
    let backend = storage::open_backend(config)
        .await
        .map_err(PipelineError::BackendUnavailable)?;
    Ok(drive(config, backend, scrapers::fetchers_for(&config.sources), ctx).await)
}

/// Run one fetch-and-write pass over an already open backend, then close it.
#[instrument(level = "info", skip_all, fields(backend = backend.name(), window = %config.window))]
pub async fn drive(
    config: &Config,
    backend: Arc<dyn StorageBackend>,
    fetchers: Vec<Arc<dyn SourceFetcher>>,
    ctx: FetchContext,
) -> RunSummary {
    let started = Instant::now();
    let orchestrator = FetchOrchestrator::new(fetchers, ctx, config.grace_period);
    let mut fetch = orchestrator.run(&config.sources, config.window);
    let writer = BatchWriter::new(
        Arc::clone(&backend),
        config.batch_size,
        config.max_buffered,
        config.flush_retry,
    );

    let mut records_seen = 0usize;
    while let Some(article) = fetch.records.recv().await {
        records_seen += 1;
        if let Err(e) = writer.push(article).await {
            error!(error = %e, "Batch writer stopped accepting records");
            break;
        }
    }

    let fetch_report = match fetch.report.await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Fetch supervisor failed");
            FetchReport::default()
        }
    };
    let flush_report = match writer.finalize().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Batch writer failed to finalize");
            FlushReport::default()
        }
    };

    let exported_rows = match &config.export {
        Some(export) => match backend.export(&export.path, export.query.as_deref()).await {
            Ok(rows) => Some(rows),
            Err(e) => {
                error!(path = %export.path.display(), error = %e, "Export failed");
                None
            }
        },
        None => None,
    };

    if let Err(e) = backend.close().await {
        warn!(error = %e, "Closing the backend failed");
    }

    let failed_batches_path = if flush_report.failed_batches.is_empty() {
        None
    } else {
        match save_failed_batches(
            &config.failed_batch_dir,
            backend.name(),
            &flush_report.failed_batches,
        )
        .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                error!(
                    dir = %config.failed_batch_dir.display(),
                    error = %e,
                    "Could not save records of failed batches"
                );
                None
            }
        }
    };

    let summary = RunSummary {
        backend: backend.name(),
        records_seen,
        inserted: flush_report.inserted,
        rejected: flush_report.rejected,
        failed_fetches: fetch_report.failed_fetches(),
        unavailable_sources: fetch_report.unavailable_sources(),
        failed_batches: flush_report.failed_batches,
        failed_batches_path,
        cancelled: fetch_report.cancelled,
        exported_rows,
        fetch: fetch_report,
        elapsed: started.elapsed(),
    };
    info!(
        records_seen = summary.records_seen,
        inserted = summary.inserted,
        rejected = summary.rejected,
        failed_fetches = summary.failed_fetches,
        failed_batches = summary.failed_batches.len(),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "Pipeline run finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use crate::config::{BackendKind, BigQuerySettings, ExportSettings, FileConfig};
    use crate::error::{SourceError, StorageError};
    use crate::models::DateWindow;
    use crate::retry::RetryPolicy;
    use crate::scrapers::FetchOutcome;
    use crate::storage::bigquery::BigQueryBackend;
    use crate::storage::duckdb::DuckDbBackend;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::sqlite::SqliteBackend;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::collections::{BTreeMap, HashSet};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 25).unwrap()
    }

    fn config(batch_size: usize) -> Config {
        let mut config = Config::resolve(&Cli::default(), FileConfig::default(), day()).unwrap();
        config.window = DateWindow::single(day());
        config.batch_size = batch_size;
        config.max_buffered = batch_size * 2;
        config.flush_retry = RetryPolicy::new(1, Duration::from_millis(1)).without_jitter();
        config
    }

    fn ctx() -> FetchContext {
        FetchContext::new(4, Duration::from_secs(5), CancellationToken::new()).unwrap()
    }

    /// 50 records spread over the three sources.
    fn synthetic() -> Vec<Article> {
        (0..50)
            .map(|i| {
                let source = Source::ALL[i % 3];
                Article::new(source, &format!("https://example.com/{source}/{i}"), day())
                    .with_title(Some(format!("Story {i}")))
                    .with_tags(["Metro Manila", "traffic"])
            })
            .collect()
    }

    struct FixedFetcher {
        source: Source,
        articles: Vec<Article>,
    }

    #[async_trait]
    impl SourceFetcher for FixedFetcher {
        fn source(&self) -> Source {
            self.source
        }

        async fn fetch(&self, _ctx: &FetchContext, _window: DateWindow) -> Result<FetchOutcome, SourceError> {
            Ok(FetchOutcome {
                articles: self.articles.clone(),
                failures: Vec::new(),
            })
        }
    }

    struct DownFetcher(Source);

    #[async_trait]
    impl SourceFetcher for DownFetcher {
        fn source(&self) -> Source {
            self.0
        }

        async fn fetch(&self, _ctx: &FetchContext, _window: DateWindow) -> Result<FetchOutcome, SourceError> {
            Err(SourceError::unavailable(self.0, "connection refused"))
        }
    }

    fn fixed_fetchers() -> Vec<Arc<dyn SourceFetcher>> {
        let records = synthetic();
        Source::ALL
            .iter()
            .map(|&source| -> Arc<dyn SourceFetcher> {
                Arc::new(FixedFetcher {
                    source,
                    articles: records.iter().filter(|a| a.source == source).cloned().collect(),
                })
            })
            .collect()
    }

    async fn counts_by_source(backend: Arc<dyn StorageBackend>) -> Vec<Vec<Option<String>>> {
        let writer = BatchWriter::new(
            Arc::clone(&backend),
            7,
            14,
            RetryPolicy::new(0, Duration::from_millis(1)),
        );
        for article in synthetic() {
            writer.push(article).await.unwrap();
        }
        let report = writer.finalize().await.unwrap();
        assert_eq!(report.inserted, 50);
        let result = backend
            .run_query("SELECT source, COUNT(*) FROM articles GROUP BY source")
            .await
            .unwrap();
        backend.close().await.unwrap();
        result.sorted_rows()
    }

    /// The memory backend stands in for BigQuery here, since a mocked
    /// `jobs.query` would only echo canned counts back.
    /// `test_bigquery_receives_the_same_rows` checks the BigQuery side on the wire.
    #[tokio::test]
    async fn test_backends_agree_on_counts() {
        let sqlite = counts_by_source(Arc::new(
            SqliteBackend::open(Path::new(":memory:"), "articles").await.unwrap(),
        ))
        .await;
        let duckdb = counts_by_source(Arc::new(
            DuckDbBackend::open(Path::new(":memory:"), "articles").await.unwrap(),
        ))
        .await;
        let memory = counts_by_source(Arc::new(MemoryBackend::new("articles"))).await;

        let expected = vec![
            vec![Some("abs-cbn".to_string()), Some("17".to_string())],
            vec![Some("inquirer".to_string()), Some("16".to_string())],
            vec![Some("manila-bulletin".to_string()), Some("17".to_string())],
        ];
        assert_eq!(memory, expected);
        assert_eq!(sqlite, expected);
        assert_eq!(duckdb, expected);
    }

    #[tokio::test]
    async fn test_bigquery_receives_the_same_rows() {
        let server = MockServer::start().await;
        for table_path in ["/projects/proj/datasets", "/projects/proj/datasets/news_data/tables"] {
            Mock::given(method("POST"))
                .and(path(table_path))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
                .mount(&server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/projects/proj/queries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobComplete": true})))
            .mount(&server)
            .await;

        let settings = BigQuerySettings {
            project: Some("proj".to_string()),
            dataset: "news_data".to_string(),
            location: "US".to_string(),
            access_token: Some("token".to_string()),
            api_base: server.uri(),
            request_timeout: Duration::from_secs(5),
        };
        let backend: Arc<dyn StorageBackend> =
            Arc::new(BigQueryBackend::open(&settings, "articles").await.unwrap());
        let writer = BatchWriter::new(
            Arc::clone(&backend),
            7,
            14,
            RetryPolicy::new(0, Duration::from_millis(1)),
        );
        for article in synthetic() {
            writer.push(article).await.unwrap();
        }
        let report = writer.finalize().await.unwrap();
        backend.close().await.unwrap();
        assert_eq!(report.inserted, 50);
        assert_eq!(report.flush_sizes, vec![7, 7, 7, 7, 7, 7, 7, 1]);

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut ids = HashSet::new();
        for request in server.received_requests().await.unwrap() {
            if request.url.path() != "/projects/proj/queries" {
                continue;
            }
            let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
            let rows = body["queryParameters"][0]["parameterValue"]["arrayValues"]
                .as_array()
                .unwrap()
                .clone();
            for row in rows {
                let fields = &row["structValues"];
                ids.insert(fields["id"]["value"].as_str().unwrap().to_string());
                *counts
                    .entry(fields["source"]["value"].as_str().unwrap().to_string())
                    .or_default() += 1;
            }
        }
        assert_eq!(ids.len(), 50);
        assert_eq!(
            counts.into_iter().collect::<Vec<_>>(),
            vec![
                ("abs-cbn".to_string(), 17),
                ("inquirer".to_string(), 16),
                ("manila-bulletin".to_string(), 17),
            ]
        );
    }

    #[tokio::test]
    async fn test_drive_writes_everything_and_closes() {
        let backend = Arc::new(MemoryBackend::new("articles"));
        let summary = drive(&config(7), backend.clone(), fixed_fetchers(), ctx()).await;

        assert_eq!(summary.records_seen, 50);
        assert_eq!(summary.inserted, 50);
        assert_eq!(summary.rejected, 0);
        assert_eq!(summary.failed_fetches, 0);
        assert!(summary.unavailable_sources.is_empty());
        assert_eq!(backend.rows().len(), 50);
        assert!(matches!(
            backend.run_query("SELECT COUNT(*) FROM articles").await,
            Err(StorageError::Closed)
        ));
        assert!(summary.to_string().contains("Records inserted:     50"));
    }

    #[tokio::test]
    async fn test_unavailable_source_does_not_stop_the_run() {
        let backend = Arc::new(MemoryBackend::new("articles"));
        let records: Vec<Article> = synthetic()
            .into_iter()
            .filter(|a| a.source == Source::AbsCbn)
            .take(10)
            .collect();
        let fetchers: Vec<Arc<dyn SourceFetcher>> = vec![
            Arc::new(FixedFetcher {
                source: Source::AbsCbn,
                articles: records,
            }),
            Arc::new(DownFetcher(Source::Inquirer)),
        ];
        let mut config = config(4);
        config.sources = vec![Source::AbsCbn, Source::Inquirer];

        let summary = drive(&config, backend.clone(), fetchers, ctx()).await;
        assert_eq!(summary.records_seen, 10);
        assert_eq!(summary.inserted, 10);
        assert_eq!(summary.unavailable_sources, vec![Source::Inquirer]);
        assert!(summary.to_string().contains("Unavailable sources:  inquirer"));
    }

    #[tokio::test]
    async fn test_failed_batch_is_reported_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(10);
        config.failed_batch_dir = tmp.path().join("failed");
        let backend = Arc::new(MemoryBackend::new("articles").fail_first(2));
        let summary = drive(&config, backend.clone(), fixed_fetchers(), ctx()).await;

        assert_eq!(summary.records_seen, 50);
        assert_eq!(summary.failed_batches.len(), 1);
        assert_eq!(summary.failed_batches[0].records.len(), 10);
        assert_eq!(summary.rejected, 10);
        assert_eq!(summary.inserted, 40);
        assert_eq!(backend.rows().len(), 40);
    }

    #[tokio::test]
    async fn test_failed_batch_records_are_saved() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(10);
        config.failed_batch_dir = tmp.path().join("failed");
        let backend = Arc::new(MemoryBackend::new("articles").fail_first(2));
        let summary = drive(&config, backend, fixed_fetchers(), ctx()).await;

        let path = summary.failed_batches_path.clone().unwrap();
        assert!(path.starts_with(tmp.path().join("failed")));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jsonl"));
        assert!(summary.to_string().contains(&path.display().to_string()));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 10);
        assert!(lines.iter().all(|l| l["batch"] == 0 && l["attempts"] == 2));
        assert!(lines[0]["error"].as_str().unwrap().contains("injected"));

        let saved: Vec<Article> = lines
            .into_iter()
            .map(|l| serde_json::from_value(l["record"].clone()).unwrap())
            .collect();
        assert_eq!(saved, summary.failed_batches[0].records);
    }

    #[tokio::test]
    async fn test_no_failed_batch_file_on_clean_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(10);
        config.failed_batch_dir = tmp.path().join("failed");
        let summary = drive(&config, Arc::new(MemoryBackend::new("articles")), fixed_fetchers(), ctx()).await;

        assert!(summary.failed_batches_path.is_none());
        assert!(!tmp.path().join("failed").exists());
    }

    #[tokio::test]
    async fn test_export_runs_before_close() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(25);
        config.export = Some(ExportSettings {
            path: tmp.path().join("exports/articles.parquet"),
            query: None,
        });
        let backend = Arc::new(MemoryBackend::new("articles"));
        let summary = drive(&config, backend, fixed_fetchers(), ctx()).await;

        assert_eq!(summary.exported_rows, Some(50));
        assert!(tmp.path().join("exports/articles.parquet").exists());
    }

    #[tokio::test]
    async fn test_unopenable_backend_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let mut config = config(10);
        config.backend = BackendKind::Sqlite;
        config.db_path = blocker.join("articles.db");

        let err = run(&config, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    }
}
