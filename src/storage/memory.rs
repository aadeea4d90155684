//! In-process backend for tests and dry runs.
//!
//! Rows live in a `BTreeMap` keyed on `id`. Failures and latency can be
//! injected so the batch writer can be exercised without real storage.
//! `run_query` understands only the handful of shapes the pipeline and
//! its tests issue:
//!
//! - `SELECT source, COUNT(*) FROM t GROUP BY source`
//! - `SELECT COUNT(*) FROM t`
//! - `SELECT col, ... FROM t` (or `*`)

use super::{COLUMNS, QueryResult, StorageBackend, dedupe_last_wins, parquet, select_all};
use crate::error::StorageError;
use crate::models::Article;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};

static GROUP_BY_SOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*select\s+source\s*,\s*count\(\*\)(?:\s+as\s+(\w+))?\s+from\s+(\w+)\s+group\s+by\s+source\s*;?\s*$",
    )
    .expect("hard-coded regular expression to be valid")
});

static COUNT_ALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*select\s+count\(\*\)(?:\s+as\s+(\w+))?\s+from\s+(\w+)\s*;?\s*$")
        .expect("hard-coded regular expression to be valid")
});

static PROJECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*select\s+(.+?)\s+from\s+(\w+)\s*;?\s*$")
        .expect("hard-coded regular expression to be valid")
});

#[derive(Default)]
struct State {
    rows: BTreeMap<String, Article>,
    calls: Vec<Vec<String>>,
    failures_left: usize,
}

pub struct MemoryBackend {
    table: String,
    state: Mutex<State>,
    latency: Duration,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            state: Mutex::new(State::default()),
            latency: Duration::ZERO,
            closed: AtomicBool::new(false),
        }
    }

    /// Make the next `calls` invocations of `insert_batch` fail.
    pub fn fail_first(self, calls: usize) -> Self {
        self.lock().failures_left = calls;
        self
    }

    /// Sleep this long inside every `insert_batch`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Ids passed to every `insert_batch` call so far, failed ones included.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.lock().calls.iter().map(Vec::len).collect()
    }

    pub fn insert_calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Stored rows, ordered by id.
    pub fn rows(&self) -> Vec<Article> {
        self.lock().rows.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_table(&self, table: &str) -> Result<(), StorageError> {
        if table.eq_ignore_ascii_case(&self.table) {
            Ok(())
        } else {
            Err(StorageError::Unsupported {
                backend: "memory",
                operation: "queries against other tables",
            })
        }
    }
}

fn cell(article: &Article, column: &str) -> Option<String> {
    match column {
        "id" => Some(article.id.clone()),
        "source" => Some(article.source.as_str().to_string()),
        "url" => article.url.clone(),
        "title" => article.title.clone(),
        "author" => article.author.clone(),
        "category" => article.category.clone(),
        "date" => Some(article.date.format("%Y-%m-%d").to_string()),
        "publish_time" => article.publish_time_sql(),
        "content" => article.content.clone(),
        "tags" => article.tags_csv(),
        _ => None,
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    #[instrument(level = "debug", skip_all, fields(records = articles.len()))]
    async fn insert_batch(&self, articles: &[Article]) -> Result<usize, StorageError> {
        self.ensure_open()?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        state.calls.push(articles.iter().map(|a| a.id.clone()).collect());
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(StorageError::Injected(format!(
                "insert_batch call {} rejected",
                state.calls.len()
            )));
        }
        let batch = dedupe_last_wins(articles);
        for article in &batch {
            state.rows.insert(article.id.clone(), (*article).clone());
        }
        debug!(written = batch.len(), stored = state.rows.len(), "Memory batch stored");
        Ok(batch.len())
    }

    async fn run_query(&self, sql: &str) -> Result<QueryResult, StorageError> {
        self.ensure_open()?;
        let state = self.lock();

        if let Some(caps) = GROUP_BY_SOURCE.captures(sql) {
            self.check_table(&caps[2])?;
            let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
            for article in state.rows.values() {
                *counts.entry(article.source.as_str()).or_default() += 1;
            }
            let count_name = caps.get(1).map_or("count", |m| m.as_str());
            return Ok(QueryResult {
                columns: vec!["source".to_string(), count_name.to_string()],
                rows: counts
                    .into_iter()
                    .map(|(source, n)| vec![Some(source.to_string()), Some(n.to_string())])
                    .collect(),
            });
        }

        if let Some(caps) = COUNT_ALL.captures(sql) {
            self.check_table(&caps[2])?;
            let count_name = caps.get(1).map_or("count", |m| m.as_str());
            return Ok(QueryResult {
                columns: vec![count_name.to_string()],
                rows: vec![vec![Some(state.rows.len().to_string())]],
            });
        }

        if let Some(caps) = PROJECTION.captures(sql) {
            self.check_table(&caps[2])?;
            let columns: Vec<String> = if caps[1].trim() == "*" {
                COLUMNS.iter().map(|c| c.to_string()).collect()
            } else {
                caps[1].split(',').map(|c| c.trim().to_lowercase()).collect()
            };
            if columns.iter().any(|c| !COLUMNS.contains(&c.as_str())) {
                return Err(StorageError::Unsupported {
                    backend: "memory",
                    operation: "expressions in the select list",
                });
            }
            let rows = state
                .rows
                .values()
                .map(|a| columns.iter().map(|c| cell(a, c)).collect())
                .collect();
            return Ok(QueryResult { columns, rows });
        }

        Err(StorageError::Unsupported {
            backend: "memory",
            operation: "arbitrary SQL",
        })
    }

    #[instrument(level = "info", skip(self), fields(path = %path.display()))]
    async fn export(&self, path: &Path, query: Option<&str>) -> Result<u64, StorageError> {
        let sql = query.map(str::to_string).unwrap_or_else(|| select_all(&self.table));
        let result = self.run_query(&sql).await?;
        let path = path.to_path_buf();
        let rows = tokio::task::spawn_blocking(move || parquet::write_parquet(&result, &path))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))??;
        info!(rows, "Exported query result");
        Ok(rows)
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory backend closed");
        }
        Ok(())
    }
}
