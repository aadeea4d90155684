//! Embedded columnar store backed by DuckDB.
//!
//! The `duckdb` driver is synchronous, so every call runs on the blocking
//! pool while holding the single connection behind a mutex. Closing takes
//! the connection out of the mutex; later calls see [`StorageError::Closed`].

use super::{QueryResult, StorageBackend, dedupe_last_wins, select_all};
use crate::error::StorageError;
use crate::models::Article;
use crate::utils::ensure_parent_dir;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate};
use duckdb::types::{TimeUnit, Value};
use duckdb::{Connection, params};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

static CSV_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bread_csv_auto\b(\s*\()?").expect("hard-coded regular expression to be valid")
});

pub struct DuckDbBackend {
    conn: Arc<Mutex<Option<Connection>>>,
    table: String,
}

impl DuckDbBackend {
    /// Open (creating if needed) the database at `path`. `:memory:` opens a private in-memory database.
    #[instrument(level = "info", skip_all, fields(path = %path.display(), %table))]
    pub async fn open(path: &Path, table: &str) -> Result<Self, StorageError> {
        let in_memory = path.as_os_str() == ":memory:";
        if !in_memory {
            ensure_parent_dir(path)
                .await
                .map_err(|e| StorageError::Task(format!("cannot create database directory: {e}")))?;
        }
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id VARCHAR PRIMARY KEY,
                source VARCHAR,
                url VARCHAR,
                title VARCHAR,
                author VARCHAR,
                category VARCHAR,
                date DATE,
                publish_time TIMESTAMP,
                content VARCHAR,
                tags VARCHAR
            )"
        );
        let path = PathBuf::from(path);
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StorageError> {
            let conn = if in_memory {
                Connection::open_in_memory()?
            } else {
                Connection::open(&path)?
            };
            conn.execute_batch(&ddl)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))??;
        info!("DuckDB backend ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            table: table.to_string(),
        })
    }

    /// Run `f` on the blocking pool with the open connection.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Task("duckdb connection lock poisoned".to_string()))?;
            let conn = guard.as_mut().ok_or(StorageError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }

    fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} (id, source, url, title, author, category, date, publish_time, content, tags)
             VALUES (?, ?, ?, ?, ?, ?, CAST(? AS DATE), CAST(? AS TIMESTAMP), ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                source = EXCLUDED.source,
                url = EXCLUDED.url,
                title = EXCLUDED.title,
                author = EXCLUDED.author,
                category = EXCLUDED.category,
                date = EXCLUDED.date,
                publish_time = EXCLUDED.publish_time,
                content = EXCLUDED.content,
                tags = EXCLUDED.tags",
            self.table
        )
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<QueryResult, StorageError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let columns = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut cells = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            cells.push(render(row.get::<_, Value>(idx)?));
        }
        out.push(cells);
    }
    Ok(QueryResult { columns, rows: out })
}

/// Render a DuckDB value the way the other backends print it.
fn render(value: Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::Boolean(b) => b.to_string(),
        Value::TinyInt(n) => n.to_string(),
        Value::SmallInt(n) => n.to_string(),
        Value::Int(n) => n.to_string(),
        Value::BigInt(n) => n.to_string(),
        Value::HugeInt(n) => n.to_string(),
        Value::UTinyInt(n) => n.to_string(),
        Value::USmallInt(n) => n.to_string(),
        Value::UInt(n) => n.to_string(),
        Value::UBigInt(n) => n.to_string(),
        Value::Float(n) => n.to_string(),
        Value::Double(n) => n.to_string(),
        Value::Decimal(n) => n.to_string(),
        Value::Text(s) => s,
        Value::Blob(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Date32(days) => match NaiveDate::from_ymd_opt(1970, 1, 1) {
            Some(epoch) => (epoch + Duration::days(i64::from(days))).to_string(),
            None => days.to_string(),
        },
        Value::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            match DateTime::from_timestamp_micros(micros) {
                Some(ts) => ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                None => raw.to_string(),
            }
        }
        other => format!("{other:?}"),
    };
    Some(text)
}

/// Point every bare `read_csv_auto` in `query` at `csv_path`.
fn bind_csv_path(query: &str, csv_path: &Path) -> String {
    let quoted = csv_path.display().to_string().replace('\'', "''");
    CSV_TOKEN
        .replace_all(query, |caps: &Captures| {
            if caps.get(1).is_some() {
                caps[0].to_string()
            } else {
                format!("read_csv_auto('{quoted}')")
            }
        })
        .into_owned()
}

fn strip_terminator(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

#[async_trait]
impl StorageBackend for DuckDbBackend {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    #[instrument(level = "debug", skip_all, fields(records = articles.len()))]
    async fn insert_batch(&self, articles: &[Article]) -> Result<usize, StorageError> {
        let batch: Vec<Article> = dedupe_last_wins(articles).into_iter().cloned().collect();
        let sql = self.upsert_sql();
        let written = self
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(&sql)?;
                    for a in &batch {
                        stmt.execute(params![
                            a.id,
                            a.source.as_str(),
                            a.url,
                            a.title,
                            a.author,
                            a.category,
                            a.date.format("%Y-%m-%d").to_string(),
                            a.publish_time_sql(),
                            a.content,
                            a.tags_csv(),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(batch.len())
            })
            .await?;
        debug!(written, "DuckDB batch committed");
        Ok(written)
    }

    async fn run_query(&self, sql: &str) -> Result<QueryResult, StorageError> {
        let sql = sql.to_string();
        self.with_conn(move |conn| query_rows(conn, &sql)).await
    }

    #[instrument(level = "info", skip(self), fields(path = %path.display()))]
    async fn export(&self, path: &Path, query: Option<&str>) -> Result<u64, StorageError> {
        ensure_parent_dir(path)
            .await
            .map_err(|e| StorageError::Task(format!("cannot create export directory: {e}")))?;
        let query = query.map(str::to_string).unwrap_or_else(|| select_all(&self.table));
        let target = path.display().to_string().replace('\'', "''");
        let query = strip_terminator(&query).to_string();
        let copy = format!("COPY ({query}) TO '{target}' (FORMAT PARQUET)");
        let count = format!("SELECT COUNT(*) FROM ({query})");
        let rows = self
            .with_conn(move |conn| {
                conn.execute_batch(&copy)?;
                let rows: i64 = conn.query_row(&count, [], |row| row.get(0))?;
                Ok(rows.max(0) as u64)
            })
            .await?;
        info!(rows, "Exported query result");
        Ok(rows)
    }

    #[instrument(level = "info", skip(self, query), fields(csv = %csv_path.display()))]
    async fn query_csv_directly(&self, csv_path: &Path, query: &str) -> Result<QueryResult, StorageError> {
        let sql = bind_csv_path(query, csv_path);
        debug!(%sql, "Querying CSV in place");
        self.with_conn(move |conn| query_rows(conn, &sql)).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Task("duckdb connection lock poisoned".to_string()))?;
            if let Some(conn) = guard.take() {
                conn.close().map_err(|(_, e)| StorageError::DuckDb(e))?;
                info!("DuckDB backend closed");
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;
    use chrono::{TimeZone, Utc};

    fn article(url: &str, title: &str) -> Article {
        Article::new(Source::ManilaBulletin, url, NaiveDate::from_ymd_opt(2025, 4, 25).unwrap())
            .published_at(Utc.with_ymd_and_hms(2025, 4, 25, 1, 0, 0).unwrap())
            .with_title(Some(title.to_string()))
            .with_tags(["Stock Market"])
    }

    async fn backend() -> DuckDbBackend {
        DuckDbBackend::open(Path::new(":memory:"), "articles").await.unwrap()
    }

    #[test]
    fn test_bind_csv_path() {
        let sql = bind_csv_path(
            "SELECT * FROM read_csv_auto WHERE x IN (SELECT y FROM read_csv_auto('other.csv'))",
            Path::new("/tmp/o'brien.csv"),
        );
        assert_eq!(
            sql,
            "SELECT * FROM read_csv_auto('/tmp/o''brien.csv') WHERE x IN (SELECT y FROM read_csv_auto('other.csv'))"
        );
    }

    #[test]
    fn test_render_temporal_values() {
        assert_eq!(render(Value::Date32(20203)).as_deref(), Some("2025-04-25"));
        assert_eq!(
            render(Value::Timestamp(TimeUnit::Microsecond, 1_745_542_800_000_000)).as_deref(),
            Some("2025-04-25 01:00:00")
        );
        assert_eq!(render(Value::Null), None);
    }

    #[tokio::test]
    async fn test_reinsert_keeps_last_write() {
        let db = backend().await;
        db.insert_batch(&[article("https://mb.com.ph/2025/04/25/a", "old")]).await.unwrap();
        db.insert_batch(&[article("https://mb.com.ph/2025/04/25/a", "new")]).await.unwrap();

        let result = db
            .run_query("SELECT title, tags, date, publish_time FROM articles")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["title", "tags", "date", "publish_time"]);
        assert_eq!(
            result.rows,
            vec![vec![
                Some("new".to_string()),
                Some("stock-market".to_string()),
                Some("2025-04-25".to_string()),
                Some("2025-04-25 01:00:00".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn test_batch_with_duplicate_ids() {
        let db = backend().await;
        let written = db
            .insert_batch(&[
                article("https://mb.com.ph/2025/04/25/a", "first"),
                article("https://mb.com.ph/2025/04/25/a", "second"),
            ])
            .await
            .unwrap();
        assert_eq!(written, 1);
        let result = db.run_query("SELECT title FROM articles").await.unwrap();
        assert_eq!(result.rows, vec![vec![Some("second".to_string())]]);
    }

    #[tokio::test]
    async fn test_query_csv_directly() {
        let tmp = tempfile::tempdir().unwrap();
        let csv = tmp.path().join("trends.csv");
        std::fs::write(&csv, "tag,hits\nsenate,3\nbudget,5\n").unwrap();

        let db = backend().await;
        let result = db
            .query_csv_directly(&csv, "SELECT tag FROM read_csv_auto WHERE hits > 4")
            .await
            .unwrap();
        assert_eq!(result.rows, vec![vec![Some("budget".to_string())]]);
    }

    #[tokio::test]
    async fn test_export_copies_to_parquet() {
        let tmp = tempfile::tempdir().unwrap();
        let db = backend().await;
        db.insert_batch(&[
            article("https://mb.com.ph/2025/04/25/a", "a"),
            article("https://mb.com.ph/2025/04/25/b", "b"),
        ])
        .await
        .unwrap();

        let out = tmp.path().join("out/articles.parquet");
        let rows = db.export(&out, Some("SELECT id, title FROM articles;")).await.unwrap();
        assert_eq!(rows, 2);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let db = backend().await;
        db.close().await.unwrap();
        db.close().await.unwrap();
        let err = db.run_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err, StorageError::Closed));
    }
}
