//! Embedded row store backed by SQLite through `sqlx`.

use super::{QueryResult, StorageBackend, dedupe_last_wins, parquet, select_all};
use crate::error::StorageError;
use crate::models::Article;
use crate::utils::ensure_parent_dir;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub struct SqliteBackend {
    pool: SqlitePool,
    table: String,
    upsert_sql: String,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `path` and ensure the raw table exists.
    #[instrument(level = "info", skip_all, fields(path = %path.display(), %table))]
    pub async fn open(path: &Path, table: &str) -> Result<Self, StorageError> {
        let in_memory = path.as_os_str() == ":memory:";
        if !in_memory {
            ensure_parent_dir(path)
                .await
                .map_err(|e| StorageError::Task(format!("cannot create database directory: {e}")))?;
        }
        let options = if in_memory {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(PathBuf::from(path))
                .create_if_missing(true)
        };
        // One connection keeps an in-memory database alive and serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                source TEXT,
                url TEXT,
                title TEXT,
                author TEXT,
                category TEXT,
                date DATE,
                publish_time TIMESTAMP,
                content TEXT,
                tags TEXT
            )"
        ))
        .execute(&pool)
        .await?;
        info!("SQLite backend ready");

        Ok(Self {
            pool,
            table: table.to_string(),
            upsert_sql: format!(
                "INSERT INTO {table} (id, source, url, title, author, category, date, publish_time, content, tags)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    source = excluded.source,
                    url = excluded.url,
                    title = excluded.title,
                    author = excluded.author,
                    category = excluded.category,
                    date = excluded.date,
                    publish_time = excluded.publish_time,
                    content = excluded.content,
                    tags = excluded.tags"
            ),
        })
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.pool.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Render one cell as text, decoding by the value's runtime storage class.
fn cell(row: &SqliteRow, idx: usize) -> Option<String> {
    let raw = row.try_get_raw(idx).ok()?;
    if raw.is_null() {
        return None;
    }
    let class = raw.type_info().name().to_string();
    match class.as_str() {
        "INTEGER" | "BOOLEAN" => row.try_get_unchecked::<i64, _>(idx).ok().map(|n| n.to_string()),
        "REAL" | "NUMERIC" => row.try_get_unchecked::<f64, _>(idx).ok().map(|n| n.to_string()),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(idx)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
        _ => row.try_get_unchecked::<String, _>(idx).ok(),
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(level = "debug", skip_all, fields(records = articles.len()))]
    async fn insert_batch(&self, articles: &[Article]) -> Result<usize, StorageError> {
        self.ensure_open()?;
        let batch = dedupe_last_wins(articles);
        let mut tx = self.pool.begin().await?;
        for article in &batch {
            sqlx::query(&self.upsert_sql)
                .bind(&article.id)
                .bind(article.source.as_str())
                .bind(&article.url)
                .bind(&article.title)
                .bind(&article.author)
                .bind(&article.category)
                .bind(article.date.format("%Y-%m-%d").to_string())
                .bind(article.publish_time_sql())
                .bind(&article.content)
                .bind(article.tags_csv())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(written = batch.len(), "SQLite batch committed");
        Ok(batch.len())
    }

    async fn run_query(&self, sql: &str) -> Result<QueryResult, StorageError> {
        self.ensure_open()?;
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| cell(row, idx)).collect())
            .collect();
        Ok(QueryResult { columns, rows })
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
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("SQLite backend closed");
        }
        Ok(())
    }
}
