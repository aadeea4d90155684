//! Error taxonomy for the ingestion pipeline.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! | Error | Scope | Effect on the run |
//! |-------|-------|-------------------|
//! | [`FetchError`] | one article or listing page | logged, skipped, counted |
//! | [`SourceError::Unavailable`] | one source | source excluded, reported |
//! | [`BatchWriteError`] | one batch | retried once, then reported with its records |
//! | [`ConfigError`] | whole run | fails before any I/O |
//! | [`PipelineError`] | whole run | only config, client setup, and backend-open failures |

use crate::models::{Article, Source};
use thiserror::Error;

/// A recoverable failure while listing or resolving a single item.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("could not parse {url}: {reason}")]
    Parse { url: String, reason: String },

    #[error("fetch of {url} cancelled")]
    Cancelled { url: String },
}

impl FetchError {
    /// The URL the failure is attached to.
    pub fn url(&self) -> &str {
        match self {
            FetchError::Http { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::Timeout { url, .. }
            | FetchError::Parse { url, .. }
            | FetchError::Cancelled { url } => url,
        }
    }
}

/// Failure of a whole source fetch.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {source_id} unavailable: {reason}")]
    Unavailable { source_id: Source, reason: String },
}

impl SourceError {
    pub fn unavailable(source_id: Source, reason: impl ToString) -> Self {
        SourceError::Unavailable {
            source_id,
            reason: reason.to_string(),
        }
    }
}

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("bigquery request failed: {0}")]
    BigQueryHttp(#[from] reqwest::Error),

    #[error("bigquery returned status {status}: {message}")]
    BigQueryApi { status: u16, message: String },

    #[error("{operation} timed out after {waited_ms}ms")]
    Timeout {
        operation: &'static str,
        waited_ms: u64,
    },

    #[error("parquet export failed: {0}")]
    Parquet(#[from] crate::storage::parquet::ParquetExportError),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("backend connection is closed")]
    Closed,

    #[error("backend task failed: {0}")]
    Task(String),

    #[error("injected failure: {0}")]
    Injected(String),
}

/// A batch that could not be written after its retry.
///
/// The records are kept so an operator can inspect or replay them.
#[derive(Debug, Error)]
#[error("batch of {} records failed after {attempts} attempts: {message}", .records.len())]
pub struct BatchWriteError {
    pub records: Vec<Article>,
    pub attempts: usize,
    pub message: String,
}

/// Invalid or missing settings, detected before any I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported storage backend {0:?}; choose sqlite, duckdb, or bigquery")]
    UnknownBackend(String),

    #[error("unknown source {0:?}; choose abs-cbn, manila-bulletin, or inquirer")]
    UnknownSource(String),

    #[error("invalid date {value:?}: expected YYYY-MM-DD")]
    InvalidDate { value: String },

    #[error("start date {start} is after end date {end}")]
    EmptyWindow {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is required for the {backend} backend")]
    Missing {
        field: &'static str,
        backend: &'static str,
    },

    #[error("table name {0:?} must contain only letters, digits, and underscores")]
    InvalidTableName(String),

    #[error("could not read config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Errors that abort a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(#[source] StorageError),

    #[error("could not build the HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
