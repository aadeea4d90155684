//! Run configuration.
//!
//! A [`Config`] is resolved once at startup from three layers, highest
//! precedence first:
//!
//! 1. CLI flags and their environment variables ([`Cli`])
//! 2. the optional YAML file named by `--config` ([`FileConfig`])
//! 3. built-in defaults
//!
//! Validation happens here, before any network or storage I/O, so a bad
//! setting fails the run immediately with a [`ConfigError`].

use crate::cli::Cli;
use crate::error::ConfigError;
use crate::models::{DateWindow, Source};
use crate::retry::RetryPolicy;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DAYS_BACK: u32 = 7;
pub const DEFAULT_CONCURRENCY: usize = 16;
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;
pub const DEFAULT_FAILED_BATCH_DIR: &str = "failed_batches";
pub const DEFAULT_TABLE_NAME: &str = "articles";
pub const DEFAULT_BQ_DATASET: &str = "news_data";
pub const DEFAULT_BQ_LOCATION: &str = "US";
pub const BIGQUERY_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Which storage technology receives the records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    DuckDb,
    BigQuery,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::DuckDb => "duckdb",
            BackendKind::BigQuery => "bigquery",
        }
    }

    fn default_db_path(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "articles_raw.db",
            BackendKind::DuckDb | BackendKind::BigQuery => "articles_raw.duckdb",
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "duckdb" => Ok(BackendKind::DuckDb),
            "bigquery" => Ok(BackendKind::BigQuery),
            _ => Err(ConfigError::UnknownBackend(s.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings read from the YAML file. Every field is optional.
///
/// ```yaml
/// backend: duckdb
/// start_date: 2025-04-25
/// sources: [inquirer, abs-cbn]
/// concurrency: 8
/// batch_size: 250
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub backend: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub days_back: Option<u32>,
    pub sources: Option<Vec<String>>,
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
    pub max_buffered: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub flush_retry_delay_ms: Option<u64>,
    pub failed_batch_dir: Option<String>,
    pub db_path: Option<String>,
    pub table_name: Option<String>,
    pub bq_project: Option<String>,
    pub bq_dataset: Option<String>,
    pub bq_location: Option<String>,
}

impl FileConfig {
    pub fn from_yaml(text: &str, path: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::File {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml(&text, path)
    }
}

/// BigQuery connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct BigQuerySettings {
    pub project: Option<String>,
    pub dataset: String,
    pub location: String,
    pub access_token: Option<String>,
    pub api_base: String,
    /// Client-side limit on each REST call.
    pub request_timeout: Duration,
}

impl fmt::Debug for BigQuerySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQuerySettings")
            .field("project", &self.project)
            .field("dataset", &self.dataset)
            .field("location", &self.location)
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("api_base", &self.api_base)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Optional post-run Parquet export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSettings {
    pub path: PathBuf,
    pub query: Option<String>,
}

/// The effective configuration of one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: BackendKind,
    pub window: DateWindow,
    pub sources: Vec<Source>,
    /// Ceiling on simultaneously in-flight network requests.
    pub concurrency: usize,
    /// Batch threshold.
    pub batch_size: usize,
    /// Hard bound on buffered plus in-flight records; producers wait above it.
    pub max_buffered: usize,
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub flush_retry: RetryPolicy,
    /// Where records of batches that failed after their retry are saved.
    pub failed_batch_dir: PathBuf,
    pub db_path: PathBuf,
    pub table_name: String,
    pub bigquery: BigQuerySettings,
    pub export: Option<ExportSettings>,
}

impl Config {
    /// Resolve the configuration for `cli`, reading the YAML file it names.
    pub fn load(cli: &Cli, today: NaiveDate) -> Result<Self, ConfigError> {
        let file = match cli.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file, today)
    }

    /// Merge the CLI layer over the file layer over defaults, then validate.
    pub fn resolve(cli: &Cli, file: FileConfig, today: NaiveDate) -> Result<Self, ConfigError> {
        let backend = match cli.backend.clone().or(file.backend) {
            Some(name) => name.parse()?,
            None => BackendKind::DuckDb,
        };

        let end = match cli.end_date.clone().or(file.end_date) {
            Some(s) => parse_date(&s)?,
            None => today,
        };
        let start = match cli.start_date.clone().or(file.start_date) {
            Some(s) => parse_date(&s)?,
            None => {
                let days_back = cli.days_back.or(file.days_back).unwrap_or(DEFAULT_DAYS_BACK);
                end - ChronoDuration::days(i64::from(days_back))
            }
        };
        if start > end {
            return Err(ConfigError::EmptyWindow { start, end });
        }

        let sources = match cli.sources.clone().or(file.sources) {
            Some(names) => {
                let mut sources = names
                    .iter()
                    .filter(|n| !n.trim().is_empty())
                    .map(|n| n.parse::<Source>())
                    .collect::<Result<Vec<_>, _>>()?;
                sources.sort();
                sources.dedup();
                sources
            }
            None => Source::ALL.to_vec(),
        };

        let concurrency = non_zero(
            cli.concurrency.or(file.concurrency).unwrap_or(DEFAULT_CONCURRENCY),
            "concurrency",
        )?;
        let batch_size = non_zero(
            cli.batch_size.or(file.batch_size).unwrap_or(DEFAULT_BATCH_SIZE),
            "batch_size",
        )?;
        let max_buffered = file
            .max_buffered
            .unwrap_or(batch_size.saturating_mul(2))
            .max(batch_size);

        let request_timeout = Duration::from_secs(non_zero(
            cli.request_timeout_secs
                .or(file.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            "request_timeout_secs",
        )?);
        let grace_period = Duration::from_secs(
            cli.grace_period_secs
                .or(file.grace_period_secs)
                .unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
        );
        let flush_retry = RetryPolicy::new(
            1,
            Duration::from_millis(file.flush_retry_delay_ms.unwrap_or(500)),
        );

        let failed_batch_dir = PathBuf::from(
            cli.failed_batch_dir
                .clone()
                .or(file.failed_batch_dir)
                .unwrap_or_else(|| DEFAULT_FAILED_BATCH_DIR.to_string()),
        );

        let table_name = cli
            .table_name
            .clone()
            .or(file.table_name)
            .unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string());
        if table_name.is_empty()
            || !table_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::InvalidTableName(table_name));
        }

        let db_path = PathBuf::from(
            cli.db_path
                .clone()
                .or(file.db_path)
                .unwrap_or_else(|| backend.default_db_path().to_string()),
        );

        let bigquery = BigQuerySettings {
            project: cli.bq_project.clone().or(file.bq_project),
            dataset: cli
                .bq_dataset
                .clone()
                .or(file.bq_dataset)
                .unwrap_or_else(|| DEFAULT_BQ_DATASET.to_string()),
            location: cli
                .bq_location
                .clone()
                .or(file.bq_location)
                .unwrap_or_else(|| DEFAULT_BQ_LOCATION.to_string()),
            access_token: cli.bq_access_token.clone(),
            api_base: BIGQUERY_API_BASE.to_string(),
            request_timeout,
        };
        if backend == BackendKind::BigQuery {
            if bigquery.project.is_none() {
                return Err(ConfigError::Missing {
                    field: "bq_project",
                    backend: "bigquery",
                });
            }
            if bigquery.access_token.is_none() {
                return Err(ConfigError::Missing {
                    field: "bq_access_token",
                    backend: "bigquery",
                });
            }
        }

        let export = cli.export_path.as_ref().map(|path| ExportSettings {
            path: PathBuf::from(path),
            query: cli.export_query.clone(),
        });

        Ok(Config {
            backend,
            window: DateWindow::new(start, end),
            sources,
            concurrency,
            batch_size,
            max_buffered,
            request_timeout,
            grace_period,
            flush_retry,
            failed_batch_dir,
            db_path,
            table_name,
            bigquery,
            export,
        })
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| ConfigError::InvalidDate {
        value: value.to_string(),
    })
}

fn non_zero<T: PartialEq + Default>(value: T, field: &'static str) -> Result<T, ConfigError> {
    if value == T::default() {
        Err(ConfigError::Zero { field })
    } else {
        Ok(value)
    }
}

/// The `--show-config` report. Secrets are masked.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "CURRENT CONFIGURATION")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "Storage backend:      {}", self.backend.as_str().to_uppercase())?;
        match self.backend {
            BackendKind::Sqlite | BackendKind::DuckDb => {
                writeln!(f, "Database path:        {}", self.db_path.display())?;
            }
            BackendKind::BigQuery => {
                writeln!(
                    f,
                    "Project:              {}",
                    self.bigquery.project.as_deref().unwrap_or("-")
                )?;
                writeln!(f, "Dataset:              {}", self.bigquery.dataset)?;
                writeln!(f, "Location:             {}", self.bigquery.location)?;
                writeln!(
                    f,
                    "Access token:         {}",
                    if self.bigquery.access_token.is_some() { "set" } else { "unset" }
                )?;
            }
        }
        writeln!(f, "Table name:           {}", self.table_name)?;
        writeln!(f, "Date window:          {} to {}", self.window.start, self.window.end)?;
        let sources: Vec<&str> = self.sources.iter().map(Source::as_str).collect();
        writeln!(f, "Sources:              {}", sources.join(", "))?;
        writeln!(f, "Concurrency ceiling:  {}", self.concurrency)?;
        writeln!(f, "Batch threshold:      {}", self.batch_size)?;
        writeln!(f, "Buffer hard bound:    {}", self.max_buffered)?;
        writeln!(f, "Request timeout:      {}s", self.request_timeout.as_secs())?;
        writeln!(f, "Cancellation grace:   {}s", self.grace_period.as_secs())?;
        writeln!(f, "Failed batch dir:     {}", self.failed_batch_dir.display())?;
        if let Some(export) = &self.export {
            writeln!(f, "Export path:          {}", export.path.display())?;
        }
        write!(f, "{rule}")
    }
}
