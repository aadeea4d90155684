//! Storage backends for the raw article table.
//!
//! Every backend implements [`StorageBackend`], so the batch writer and the
//! pipeline never see a concrete storage technology.
//!
//! | Backend | Module | Medium | `query_csv_directly` |
//! |---------|--------|--------|----------------------|
//! | SQLite | [`sqlite`] | embedded, row oriented | unsupported |
//! | DuckDB | [`duckdb`] | embedded, columnar | supported |
//! | BigQuery | [`bigquery`] | cloud warehouse | unsupported |
//! | Memory | [`memory`] | process memory, for tests | unsupported |
//!
//! # Conflict Policy
//!
//! Writes are upserts keyed on `id`: re-inserting a record replaces the
//! stored row with the newer field values. A batch is de-duplicated before
//! it is written, keeping the last occurrence of each id.

use crate::config::{BackendKind, Config};
use crate::error::StorageError;
use crate::models::Article;
use async_trait::async_trait;
use itertools::Itertools;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub mod bigquery;
pub mod duckdb;
pub mod memory;
pub mod parquet;
pub mod sqlite;

/// Raw table columns, in storage order.
pub const COLUMNS: [&str; 10] = [
    "id",
    "source",
    "url",
    "title",
    "author",
    "category",
    "date",
    "publish_time",
    "content",
    "tags",
];

/// Tabular result of [`StorageBackend::run_query`].
///
/// Every cell is rendered as text so results compare equal across backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows sorted lexicographically, for order-insensitive comparisons.
    pub fn sorted_rows(&self) -> Vec<Vec<Option<String>>> {
        let mut rows = self.rows.clone();
        rows.sort();
        rows
    }
}

/// The capability every storage technology provides.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs and reports.
    fn name(&self) -> &'static str;

    /// Upsert a single record.
    async fn insert_one(&self, article: &Article) -> Result<(), StorageError> {
        self.insert_batch(std::slice::from_ref(article)).await.map(|_| ())
    }

    /// Upsert `articles` in one round trip. Returns the number of rows written.
    async fn insert_batch(&self, articles: &[Article]) -> Result<usize, StorageError>;

    /// Run an analytical query and return its rows.
    async fn run_query(&self, sql: &str) -> Result<QueryResult, StorageError>;

    /// Write the result of `query` (default: the whole raw table) to a Parquet file.
    async fn export(&self, path: &Path, query: Option<&str>) -> Result<u64, StorageError>;

    /// Run `query` against an external CSV file without importing it first.
    async fn query_csv_directly(
        &self,
        _csv_path: &Path,
        _query: &str,
    ) -> Result<QueryResult, StorageError> {
        Err(StorageError::Unsupported {
            backend: self.name(),
            operation: "query_csv_directly",
        })
    }

    /// Release the handle. Calling it again is a no-op.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Open the backend selected in `config`.
pub async fn open_backend(config: &Config) -> Result<Arc<dyn StorageBackend>, StorageError> {
    info!(backend = %config.backend, table = %config.table_name, "Opening storage backend");
    let backend: Arc<dyn StorageBackend> = match config.backend {
        BackendKind::Sqlite => {
            Arc::new(sqlite::SqliteBackend::open(&config.db_path, &config.table_name).await?)
        }
        BackendKind::DuckDb => {
            Arc::new(duckdb::DuckDbBackend::open(&config.db_path, &config.table_name).await?)
        }
        BackendKind::BigQuery => {
            Arc::new(bigquery::BigQueryBackend::open(&config.bigquery, &config.table_name).await?)
        }
    };
    Ok(backend)
}

/// Drop repeated ids from a batch, keeping the last occurrence of each.
///
/// Surviving records stay in their original relative order.
pub fn dedupe_last_wins(articles: &[Article]) -> Vec<&Article> {
    let mut kept: Vec<&Article> = articles
        .iter()
        .rev()
        .unique_by(|a| a.id.as_str())
        .collect();
    kept.reverse();
    kept
}

/// `SELECT * FROM {table}`, the default export query.
pub fn select_all(table: &str) -> String {
    format!("SELECT {} FROM {table}", COLUMNS.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use chrono::NaiveDate;

    fn article(url: &str, title: &str) -> Article {
        Article::new(
            Source::AbsCbn,
            url,
            NaiveDate::from_ymd_opt(2025, 4, 25).unwrap(),
        )
        .with_title(Some(title.to_string()))
    }

    #[test]
    fn test_dedupe_keeps_last_occurrence_in_order() {
        let batch = vec![
            article("https://a.example/1", "first"),
            article("https://a.example/2", "other"),
            article("https://a.example/1", "second"),
        ];
        let kept = dedupe_last_wins(&batch);
        let titles: Vec<_> = kept.iter().filter_map(|a| a.title.as_deref()).collect();
        assert_eq!(titles, vec!["other", "second"]);
    }

    #[test]
    fn test_sorted_rows_ignores_order() {
        let a = QueryResult {
            columns: vec!["x".to_string()],
            rows: vec![vec![Some("b".to_string())], vec![Some("a".to_string())]],
        };
        let b = QueryResult {
            columns: vec!["x".to_string()],
            rows: vec![vec![Some("a".to_string())], vec![Some("b".to_string())]],
        };
        assert_eq!(a.sorted_rows(), b.sorted_rows());
    }

    #[test]
    fn test_select_all_lists_columns() {
        assert_eq!(
            select_all("articles"),
            "SELECT id, source, url, title, author, category, date, publish_time, content, tags FROM articles"
        );
    }
}
