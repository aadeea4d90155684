//! Batch writer between the fetch stream and a storage backend.
//!
//! Records are buffered in push order and written in batches of at most
//! `threshold` records by a single background flusher task. The buffer
//! moves through `empty → filling → flushing → empty`:
//!
//! - [`BatchWriter::push`] appends to the buffer and wakes the flusher once
//!   the threshold is reached. It returns immediately while buffered plus
//!   in-flight records stay under the hard bound, and waits otherwise.
//! - The flusher takes the oldest `threshold` records, calls
//!   [`StorageBackend::insert_batch`], and frees their capacity when the call
//!   returns, whatever the outcome.
//! - [`BatchWriter::finalize`] flushes whatever is left, below threshold or
//!   not, and returns the [`FlushReport`].
//!
//! A failed flush is retried with backoff per the configured
//! [`RetryPolicy`]. A batch that still fails becomes a [`BatchWriteError`]
//! holding its records, and the writer moves on to the next batch.

use crate::error::{BatchWriteError, StorageError};
use crate::models::Article;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::storage::StorageBackend;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of every flush in a run.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Size of each flush, in flush order.
    pub flush_sizes: Vec<usize>,
    /// Records in batches the backend accepted.
    pub inserted: usize,
    /// Records in batches that failed after their retry.
    pub rejected: usize,
    /// Rows the backend reported written. Lower than `inserted` when a batch repeats an id.
    pub rows_written: usize,
    /// Retry attempts across all flushes.
    pub retries: usize,
    pub failed_batches: Vec<BatchWriteError>,
    /// Highest buffered plus in-flight record count observed.
    pub peak_buffered: usize,
}

impl FlushReport {
    pub fn pushed(&self) -> usize {
        self.inserted + self.rejected
    }
}

struct Buffer {
    records: VecDeque<Article>,
    in_flight: usize,
    finishing: bool,
    peak: usize,
}

struct Shared {
    buffer: Mutex<Buffer>,
    capacity: Semaphore,
    wake: Notify,
    threshold: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct BatchWriter {
    shared: Arc<Shared>,
    flusher: JoinHandle<FlushReport>,
}

impl BatchWriter {
    /// Start a writer over `backend`.
    ///
    /// `max_buffered` is raised to `threshold` if it is lower, so a full batch
    /// always fits. Both are capped at [`Semaphore::MAX_PERMITS`].
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        threshold: usize,
        max_buffered: usize,
        retry: RetryPolicy,
    ) -> Self {
        let threshold = threshold.clamp(1, Semaphore::MAX_PERMITS);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                records: VecDeque::with_capacity(threshold.min(1024)),
                in_flight: 0,
                finishing: false,
                peak: 0,
            }),
            capacity: Semaphore::new(max_buffered.clamp(threshold, Semaphore::MAX_PERMITS)),
            wake: Notify::new(),
            threshold,
        });
        let flusher = tokio::spawn(run_flusher(Arc::clone(&shared), backend, retry));
        Self { shared, flusher }
    }

    /// Buffer one record, waiting while the hard bound is reached.
    pub async fn push(&self, article: Article) -> Result<(), StorageError> {
        let permit = self
            .shared
            .capacity
            .acquire()
            .await
            .map_err(|_| StorageError::Closed)?;
        permit.forget();

        let mut buffer = self.shared.lock();
        buffer.records.push_back(article);
        buffer.peak = buffer.peak.max(buffer.records.len() + buffer.in_flight);
        if buffer.records.len() >= self.shared.threshold {
            self.shared.wake.notify_one();
        }
        Ok(())
    }

    /// Records currently buffered or being flushed.
    pub fn pending(&self) -> usize {
        let buffer = self.shared.lock();
        buffer.records.len() + buffer.in_flight
    }

    /// Flush the remaining records and stop the flusher.
    pub async fn finalize(self) -> Result<FlushReport, StorageError> {
        self.shared.lock().finishing = true;
        self.shared.wake.notify_one();
        let report = self
            .flusher
            .await
            .map_err(|e| StorageError::Task(format!("flusher task failed: {e}")))?;
        info!(
            flushes = report.flush_sizes.len(),
            inserted = report.inserted,
            rejected = report.rejected,
            retries = report.retries,
            peak_buffered = report.peak_buffered,
            "Batch writer finalized"
        );
        Ok(report)
    }
}

async fn run_flusher(
    shared: Arc<Shared>,
    backend: Arc<dyn StorageBackend>,
    retry: RetryPolicy,
) -> FlushReport {
    let mut report = FlushReport::default();
    loop {
        let batch = {
            let mut buffer = shared.lock();
            let len = buffer.records.len();
            if len >= shared.threshold || (buffer.finishing && len > 0) {
                let take = len.min(shared.threshold);
                buffer.in_flight = take;
                Some(buffer.records.drain(..take).collect::<Vec<_>>())
            } else if buffer.finishing {
                report.peak_buffered = buffer.peak;
                break;
            } else {
                None
            }
        };

        match batch {
            Some(batch) => {
                let size = batch.len();
                flush(&*backend, &retry, batch, &mut report).await;
                shared.lock().in_flight = 0;
                shared.capacity.add_permits(size);
            }
            None => shared.wake.notified().await,
        }
    }
    report
}

#[instrument(level = "info", skip_all, fields(backend = backend.name(), records = batch.len()))]
async fn flush(
    backend: &dyn StorageBackend,
    retry: &RetryPolicy,
    batch: Vec<Article>,
    report: &mut FlushReport,
) {
    report.flush_sizes.push(batch.len());
    let t0 = Instant::now();
    let outcome = retry_with_backoff(retry, "insert_batch", || backend.insert_batch(&batch)).await;

    match outcome {
        Ok((written, attempts)) => {
            report.inserted += batch.len();
            report.rows_written += written;
            report.retries += attempts - 1;
            if attempts > 1 {
                warn!(attempts, "Batch written after retry");
            }
            debug!(written, elapsed_ms = t0.elapsed().as_millis() as u64, "Batch flushed");
        }
        Err(exhausted) => {
            report.retries += exhausted.attempts - 1;
            report.rejected += batch.len();
            error!(
                attempts = exhausted.attempts,
                error = %exhausted.error,
                "Batch rejected; keeping its records for inspection"
            );
            report.failed_batches.push(BatchWriteError {
                records: batch,
                attempts: exhausted.attempts,
                message: exhausted.error.to_string(),
            });
        }
    }
}
