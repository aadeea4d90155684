//! Command-line interface definitions for the news ingestion pipeline.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Every option can also come from an environment variable (a `.env` file is
//! loaded at startup) or from the optional YAML file passed with `--config`.
//! Values left unset fall through to [`crate::config::Config`] defaults.

use clap::Parser;

/// Command-line arguments for a pipeline run.
///
/// # Examples
///
/// ```sh
/// # Last week of articles into a local DuckDB file
/// news_ingest --backend duckdb --db-path ./articles_raw.duckdb
///
/// # A fixed window from two sources, eight requests in flight
/// news_ingest --start-date 2025-04-25 --end-date 2025-04-30 --sources inquirer,abs-cbn --concurrency 8
///
/// # Print the effective configuration and exit
/// news_ingest --backend bigquery --show-config
/// ```
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Storage backend: sqlite, duckdb, or bigquery
    #[arg(short, long, env = "STORAGE_BACKEND")]
    pub backend: Option<String>,

    /// First publication day to fetch (YYYY-MM-DD)
    #[arg(short, long, env = "START_DATE")]
    pub start_date: Option<String>,

    /// Last publication day to fetch (YYYY-MM-DD, default today)
    #[arg(short, long, env = "END_DATE")]
    pub end_date: Option<String>,

    /// Days to look back when no start date is given
    #[arg(long, env = "DAYS_BACK")]
    pub days_back: Option<u32>,

    /// Comma-separated sources to fetch (default all)
    #[arg(long, env = "NEWS_SOURCES", value_delimiter = ',')]
    pub sources: Option<Vec<String>>,

    /// Maximum number of network requests in flight across all sources
    #[arg(long, env = "FETCH_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Records buffered before a batch insert is triggered
    #[arg(long, env = "BATCH_SIZE")]
    pub batch_size: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS")]
    pub request_timeout_secs: Option<u64>,

    /// Seconds in-flight fetches may drain after cancellation
    #[arg(long, env = "GRACE_PERIOD_SECS")]
    pub grace_period_secs: Option<u64>,

    /// Directory for records of batches that could not be written
    #[arg(long, env = "FAILED_BATCH_DIR")]
    pub failed_batch_dir: Option<String>,

    /// Database file for the sqlite and duckdb backends
    #[arg(long, env = "DB_PATH")]
    pub db_path: Option<String>,

    /// Raw table name
    #[arg(long, env = "TABLE_NAME")]
    pub table_name: Option<String>,

    /// Google Cloud project for the bigquery backend
    #[arg(long, env = "GCP_PROJECT_ID")]
    pub bq_project: Option<String>,

    /// BigQuery dataset
    #[arg(long, env = "BQ_DATASET_ID")]
    pub bq_dataset: Option<String>,

    /// BigQuery dataset location
    #[arg(long, env = "BQ_LOCATION")]
    pub bq_location: Option<String>,

    /// OAuth access token for the BigQuery REST API
    #[arg(long, env = "GOOGLE_OAUTH_ACCESS_TOKEN", hide_env_values = true)]
    pub bq_access_token: Option<String>,

    /// Optional path to a YAML config file
    #[arg(short, long)]
    pub config: Option<String>,

    /// Write the result of --export-query to this Parquet file after the run
    #[arg(long)]
    pub export_path: Option<String>,

    /// Query to export (default: the whole raw table)
    #[arg(long)]
    pub export_query: Option<String>,

    /// Print the effective configuration and exit without any I/O
    #[arg(long)]
    pub show_config: bool,
}
