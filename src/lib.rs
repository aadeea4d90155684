//! # News Ingest
//!
//! An ingestion pipeline that collects articles from Philippine news
//! publishers, normalizes them into one record shape, and loads them into an
//! interchangeable storage backend for trend analysis.
//!
//! ## Architecture
//!
//! 1. **Fetching**: one [`scrapers::SourceFetcher`] per publisher lists a date
//!    window and resolves every article. The [`orchestrator`] runs them
//!    concurrently under one global in-flight ceiling.
//! 2. **Buffering**: the [`writer::BatchWriter`] groups the record stream into
//!    batches and applies backpressure when storage falls behind.
//! 3. **Storage**: batches are upserted by id into SQLite, DuckDB, or BigQuery
//!    through the [`storage::StorageBackend`] trait.
//! 4. **Summary**: the [`pipeline`] driver reports what was seen, written, and
//!    lost.

pub mod cli;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod scrapers;
pub mod storage;
pub mod utils;
pub mod writer;
