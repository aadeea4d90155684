//! Cloud columnar warehouse backend speaking the BigQuery REST API.
//!
//! # Endpoints
//!
//! | Call | Endpoint |
//! |------|----------|
//! | create dataset | `POST /projects/{p}/datasets` |
//! | create table | `POST /projects/{p}/datasets/{d}/tables` |
//! | run a query | `POST /projects/{p}/queries` |
//! | poll or page results | `GET /projects/{p}/queries/{job}` |
//!
//! Batches are written with a single `MERGE` keyed on `id`. The batch is
//! bound as one `ARRAY<STRUCT<...>>` query parameter, so a flush is one
//! round trip no matter how many rows it carries.
//!
//! Every call is bounded by the configured request timeout, and waiting on a
//! running job is bounded by a job deadline. Either limit surfaces as
//! [`StorageError::Timeout`].

use super::{COLUMNS, QueryResult, StorageBackend, dedupe_last_wins, parquet, select_all};
use crate::config::BigQuerySettings;
use crate::error::StorageError;
use crate::models::Article;
use crate::utils::truncate_for_log;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JOB_DEADLINE: Duration = Duration::from_secs(300);
/// Longest the server may hold a `jobs.query` call open before answering.
const QUERY_TIMEOUT_MS: u64 = 10_000;

/// BigQuery type of each raw table column, in [`COLUMNS`] order.
const COLUMN_TYPES: [&str; 10] = [
    "STRING", "STRING", "STRING", "STRING", "STRING", "STRING", "DATE", "TIMESTAMP", "STRING",
    "STRING",
];

pub struct BigQueryBackend {
    client: reqwest::Client,
    api_base: String,
    project: String,
    dataset: String,
    location: String,
    token: String,
    table: String,
    request_timeout: Duration,
    poll_interval: Duration,
    job_deadline: Duration,
    closed: AtomicBool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    location: &'a str,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameter_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    query_parameters: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| truncate_for_log(&body, 300));
    Err(StorageError::BigQueryApi {
        status: status.as_u16(),
        message,
    })
}

fn cell_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn param(value: Option<String>) -> Value {
    match value {
        Some(v) => json!({ "value": v }),
        None => json!({}),
    }
}

fn rows_parameter(batch: &[&Article]) -> Value {
    let struct_types: Vec<Value> = COLUMNS
        .iter()
        .zip(COLUMN_TYPES)
        .map(|(name, ty)| json!({ "name": name, "type": { "type": ty } }))
        .collect();
    let values: Vec<Value> = batch
        .iter()
        .map(|a| {
            let cells = [
                Some(a.id.clone()),
                Some(a.source.as_str().to_string()),
                a.url.clone(),
                a.title.clone(),
                a.author.clone(),
                a.category.clone(),
                Some(a.date.format("%Y-%m-%d").to_string()),
                a.publish_time_sql(),
                a.content.clone(),
                a.tags_csv(),
            ];
            let fields: serde_json::Map<String, Value> = COLUMNS
                .iter()
                .zip(cells)
                .map(|(name, v)| (name.to_string(), param(v)))
                .collect();
            json!({ "structValues": fields })
        })
        .collect();
    json!({
        "name": "rows",
        "parameterType": {
            "type": "ARRAY",
            "arrayType": { "type": "STRUCT", "structTypes": struct_types }
        },
        "parameterValue": { "arrayValues": values }
    })
}

impl BigQueryBackend {
    /// Connect and create the dataset and raw table when missing.
    #[instrument(level = "info", skip_all, fields(dataset = %settings.dataset, %table))]
    pub async fn open(settings: &BigQuerySettings, table: &str) -> Result<Self, StorageError> {
        let project = settings
            .project
            .clone()
            .ok_or_else(|| StorageError::Task("bigquery project id is not set".to_string()))?;
        let token = settings
            .access_token
            .clone()
            .ok_or_else(|| StorageError::Task("bigquery access token is not set".to_string()))?;

        let backend = Self {
            client: reqwest::Client::builder()
                .timeout(settings.request_timeout)
                .build()?,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            project,
            dataset: settings.dataset.clone(),
            location: settings.location.clone(),
            token,
            table: table.to_string(),
            request_timeout: settings.request_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            job_deadline: DEFAULT_JOB_DEADLINE,
            closed: AtomicBool::new(false),
        };
        backend.create_dataset().await?;
        backend.create_table().await?;
        info!("BigQuery backend ready");
        Ok(backend)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up on a query job still running after `deadline`.
    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline = deadline;
        self
    }

    /// Server-side wait for `jobs.query`, kept well inside the client timeout.
    fn server_wait_ms(&self) -> u64 {
        let half = (self.request_timeout.as_millis() / 2) as u64;
        QUERY_TIMEOUT_MS.min(half.max(1))
    }

    fn http_error(&self, error: reqwest::Error, operation: &'static str) -> StorageError {
        if error.is_timeout() {
            StorageError::Timeout {
                operation,
                waited_ms: self.request_timeout.as_millis() as u64,
            }
        } else {
            StorageError::BigQueryHttp(error)
        }
    }

    /// Send an authenticated request, mapping a client timeout to [`StorageError::Timeout`].
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<reqwest::Response, StorageError> {
        request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.http_error(e, operation))
    }

    async fn read_page(
        &self,
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<QueryResponse, StorageError> {
        check(response)
            .await?
            .json()
            .await
            .map_err(|e| self.http_error(e, operation))
    }

    fn table_ref(&self) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, self.table)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// POST `body` to `url`, treating 409 (already exists) as success.
    async fn create(&self, url: String, body: Value, what: &str) -> Result<(), StorageError> {
        let response = self
            .send(self.client.post(&url).json(&body), "create request")
            .await?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            debug!(what, "Already exists");
            return Ok(());
        }
        check(response).await?;
        info!(what, "Created");
        Ok(())
    }

    async fn create_dataset(&self) -> Result<(), StorageError> {
        let url = format!("{}/projects/{}/datasets", self.api_base, self.project);
        let body = json!({
            "datasetReference": { "projectId": self.project, "datasetId": self.dataset },
            "location": self.location,
        });
        self.create(url, body, "dataset").await
    }

    async fn create_table(&self) -> Result<(), StorageError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.api_base, self.project, self.dataset
        );
        let fields: Vec<Value> = COLUMNS
            .iter()
            .zip(COLUMN_TYPES)
            .map(|(name, ty)| {
                if *name == "id" {
                    json!({ "name": name, "type": ty, "mode": "REQUIRED" })
                } else {
                    json!({ "name": name, "type": ty })
                }
            })
            .collect();
        let body = json!({
            "tableReference": {
                "projectId": self.project,
                "datasetId": self.dataset,
                "tableId": self.table,
            },
            "schema": { "fields": fields },
        });
        self.create(url, body, "table").await
    }

    /// Run `sql` with `parameters` and wait for every result page.
    async fn execute(&self, sql: &str, parameters: Vec<Value>) -> Result<QueryResult, StorageError> {
        self.ensure_open()?;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            location: &self.location,
            timeout_ms: self.server_wait_ms(),
            parameter_mode: if parameters.is_empty() { None } else { Some("NAMED") },
            query_parameters: parameters,
        };
        let url = format!("{}/projects/{}/queries", self.api_base, self.project);
        let response = self
            .send(self.client.post(&url).json(&request), "jobs.query")
            .await?;
        let mut page = self.read_page(response, "jobs.query").await?;

        let deadline = Instant::now() + self.job_deadline;
        let mut polls = 0usize;
        while !page.job_complete {
            if Instant::now() >= deadline {
                return Err(StorageError::Timeout {
                    operation: "query job",
                    waited_ms: self.job_deadline.as_millis() as u64,
                });
            }
            polls += 1;
            debug!(polls, "Query still running");
            tokio::time::sleep(self.poll_interval).await;
            page = self.results_page(&page, None).await?;
        }

        let columns: Vec<String> = page
            .schema
            .as_ref()
            .map(|s| s.fields.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();
        let mut rows = Vec::new();
        loop {
            rows.extend(
                page.rows
                    .drain(..)
                    .map(|row| row.f.into_iter().map(|c| cell_text(c.v)).collect::<Vec<_>>()),
            );
            match page.page_token.clone() {
                Some(token) => page = self.results_page(&page, Some(&token)).await?,
                None => break,
            }
        }
        Ok(QueryResult { columns, rows })
    }

    /// `jobs.getQueryResults` for the job behind `previous`.
    async fn results_page(
        &self,
        previous: &QueryResponse,
        page_token: Option<&str>,
    ) -> Result<QueryResponse, StorageError> {
        let job = previous.job_reference.as_ref().ok_or_else(|| StorageError::BigQueryApi {
            status: 200,
            message: "query response has no job reference".to_string(),
        })?;
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base, self.project, job.job_id
        );
        let mut query = vec![
            ("location", job.location.clone().unwrap_or_else(|| self.location.clone())),
            ("timeoutMs", self.server_wait_ms().to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        let response = self
            .send(self.client.get(&url).query(&query), "jobs.getQueryResults")
            .await?;
        let mut page = self.read_page(response, "jobs.getQueryResults").await?;
        if page.job_reference.is_none() {
            page.job_reference = Some(JobReference {
                job_id: job.job_id.clone(),
                location: job.location.clone(),
            });
        }
        Ok(page)
    }

    fn merge_sql(&self) -> String {
        let updates = COLUMNS
            .iter()
            .filter(|c| **c != "id")
            .map(|c| format!("{c} = S.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let values = COLUMNS
            .iter()
            .map(|c| format!("S.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "MERGE {} AS T USING (SELECT * FROM UNNEST(@rows)) AS S ON T.id = S.id \
             WHEN MATCHED THEN UPDATE SET {updates} \
             WHEN NOT MATCHED THEN INSERT ({}) VALUES ({values})",
            self.table_ref(),
            COLUMNS.join(", ")
        )
    }
}

#[async_trait]
impl StorageBackend for BigQueryBackend {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    #[instrument(level = "debug", skip_all, fields(records = articles.len()))]
    async fn insert_batch(&self, articles: &[Article]) -> Result<usize, StorageError> {
        self.ensure_open()?;
        let batch = dedupe_last_wins(articles);
        if batch.is_empty() {
            return Ok(0);
        }
        self.execute(&self.merge_sql(), vec![rows_parameter(&batch)]).await?;
        debug!(written = batch.len(), "BigQuery MERGE complete");
        Ok(batch.len())
    }

    async fn run_query(&self, sql: &str) -> Result<QueryResult, StorageError> {
        self.execute(sql, Vec::new()).await
    }

    #[instrument(level = "info", skip(self), fields(path = %path.display()))]
    async fn export(&self, path: &Path, query: Option<&str>) -> Result<u64, StorageError> {
        let sql = query
            .map(str::to_string)
            .unwrap_or_else(|| select_all(&self.table_ref()));
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
            info!("BigQuery backend closed");
        } else {
            debug!("BigQuery backend already closed");
        }
        Ok(())
    }
}
