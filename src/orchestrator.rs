//! Concurrent fetch orchestration across sources and date partitions.
//!
//! [`FetchOrchestrator::run`] spawns one task per `(source, partition)` and
//! streams every record it receives into a bounded channel, so the writer
//! can start flushing before the slowest source finishes. All tasks share a
//! single [`FetchContext`], which is where the global in-flight ceiling
//! lives.
//!
//! # Failure Isolation
//!
//! A partition that fails as a whole is recorded against its source and the
//! other tasks carry on. A source is reported unavailable when every one of
//! its partitions failed.
//!
//! # Cancellation
//!
//! Once the context's token is cancelled no new request is issued. Requests
//! already in flight get `grace` to finish; after that every remaining task
//! is stopped and its partition is recorded as aborted.

use crate::error::SourceError;
use crate::models::{Article, DateWindow, Source};
use crate::scrapers::{FetchContext, SourceFetcher};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Per-source tally of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: Source,
    pub partitions: usize,
    pub failed_partitions: usize,
    pub records: usize,
    pub failed_items: usize,
    pub errors: Vec<String>,
}

impl SourceReport {
    fn new(source: Source) -> Self {
        Self {
            source,
            partitions: 0,
            failed_partitions: 0,
            records: 0,
            failed_items: 0,
            errors: Vec::new(),
        }
    }

    /// Every partition of this source failed.
    pub fn is_unavailable(&self) -> bool {
        self.partitions > 0 && self.failed_partitions == self.partitions
    }
}

/// Structured outcome of a fetch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub sources: Vec<SourceReport>,
    pub cancelled: bool,
    pub peak_in_flight: usize,
}

impl FetchReport {
    pub fn records(&self) -> usize {
        self.sources.iter().map(|s| s.records).sum()
    }

    pub fn unavailable_sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| s.is_unavailable())
            .map(|s| s.source)
            .collect()
    }

    /// Failed items, plus failed partitions of sources that still delivered.
    pub fn failed_fetches(&self) -> usize {
        self.sources
            .iter()
            .map(|s| {
                if s.is_unavailable() {
                    s.failed_items
                } else {
                    s.failed_items + s.failed_partitions
                }
            })
            .sum()
    }
}

impl fmt::Display for FetchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.sources {
            writeln!(
                f,
                "  {:<16} records={:<6} failed_items={:<4} partitions={}/{}{}",
                s.source.as_str(),
                s.records,
                s.failed_items,
                s.partitions - s.failed_partitions,
                s.partitions,
                if s.is_unavailable() { " UNAVAILABLE" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// Handles returned by [`FetchOrchestrator::run`].
///
/// `records` ends once every task has finished; `report` resolves after that.
pub struct FetchRun {
    pub records: mpsc::Receiver<Article>,
    pub report: JoinHandle<FetchReport>,
}

struct PartitionResult {
    source: Source,
    partition: DateWindow,
    result: Result<(usize, Vec<String>), SourceError>,
}

/// Runs fetchers concurrently and funnels their records into one channel.
pub struct FetchOrchestrator {
    fetchers: Vec<Arc<dyn SourceFetcher>>,
    ctx: FetchContext,
    grace: Duration,
    channel_capacity: usize,
}

impl FetchOrchestrator {
    pub fn new(fetchers: Vec<Arc<dyn SourceFetcher>>, ctx: FetchContext, grace: Duration) -> Self {
        Self {
            fetchers,
            ctx,
            grace,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Start fetching `sources` for `window`.
    ///
    /// Sources with no registered fetcher are skipped with a warning. The
    /// orchestrator can be run again after the returned [`FetchRun`] is done.
    #[instrument(level = "info", skip(self, window), fields(%window))]
    pub fn run(&self, sources: &[Source], window: DateWindow) -> FetchRun {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let hard_stop = CancellationToken::new();
        let mut reports: BTreeMap<Source, SourceReport> = BTreeMap::new();
        let mut tasks = JoinSet::new();

        for source in sources {
            let Some(fetcher) = self.fetchers.iter().find(|f| f.source() == *source) else {
                warn!(%source, "No fetcher registered for source; skipping");
                continue;
            };
            let report = reports
                .entry(*source)
                .or_insert_with(|| SourceReport::new(*source));

            for partition in fetcher.partitions(window) {
                report.partitions += 1;
                tasks.spawn(fetch_partition(
                    Arc::clone(fetcher),
                    self.ctx.clone(),
                    partition,
                    tx.clone(),
                    hard_stop.clone(),
                ));
            }
        }
        drop(tx);

        info!(tasks = tasks.len(), "Started fetch tasks");
        let report = tokio::spawn(supervise(
            tasks,
            reports,
            self.ctx.clone(),
            self.grace,
            hard_stop,
        ));
        FetchRun {
            records: rx,
            report,
        }
    }
}

async fn fetch_partition(
    fetcher: Arc<dyn SourceFetcher>,
    ctx: FetchContext,
    partition: DateWindow,
    tx: mpsc::Sender<Article>,
    hard_stop: CancellationToken,
) -> PartitionResult {
    let source = fetcher.source();
    let fetched = tokio::select! {
        res = fetcher.fetch(&ctx, partition) => res,
        _ = hard_stop.cancelled() => Err(SourceError::unavailable(
            source,
            "aborted after the cancellation grace period",
        )),
    };

    let result = match fetched {
        Ok(outcome) => {
            let failures = outcome.failures.iter().map(ToString::to_string).collect();
            let mut sent = 0;
            for article in outcome.articles {
                if tx.send(article).await.is_err() {
                    warn!(%source, "Record receiver dropped; discarding remaining records");
                    break;
                }
                sent += 1;
            }
            Ok((sent, failures))
        }
        Err(e) => Err(e),
    };
    PartitionResult {
        source,
        partition,
        result,
    }
}

async fn supervise(
    mut tasks: JoinSet<PartitionResult>,
    mut reports: BTreeMap<Source, SourceReport>,
    ctx: FetchContext,
    grace: Duration,
    hard_stop: CancellationToken,
) -> FetchReport {
    let cancel = ctx.cancel_token().clone();
    let mut cancelled = false;
    let deadline = tokio::time::sleep(Duration::MAX);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                match joined {
                    Ok(done) => record(&mut reports, done),
                    Err(e) => error!(error = %e, "Fetch task failed"),
                }
            }
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                warn!(grace_ms = grace.as_millis() as u64, "Cancellation requested; draining in-flight fetches");
                deadline.as_mut().reset(tokio::time::Instant::now() + grace);
            }
            _ = &mut deadline, if cancelled && !hard_stop.is_cancelled() => {
                warn!(remaining = tasks.len(), "Grace period elapsed; aborting remaining fetches");
                hard_stop.cancel();
            }
        }
    }

    let report = FetchReport {
        sources: reports.into_values().collect(),
        cancelled,
        peak_in_flight: ctx.peak_in_flight(),
    };
    info!(
        records = report.records(),
        failed_fetches = report.failed_fetches(),
        unavailable = report.unavailable_sources().len(),
        peak_in_flight = report.peak_in_flight,
        "Fetch run finished"
    );
    report
}

fn record(reports: &mut BTreeMap<Source, SourceReport>, done: PartitionResult) {
    let Some(report) = reports.get_mut(&done.source) else {
        return;
    };
    match done.result {
        Ok((records, failures)) => {
            report.records += records;
            report.failed_items += failures.len();
            report.errors.extend(failures);
        }
        Err(e) => {
            error!(source = %done.source, partition = %done.partition, error = %e, "Partition failed");
            report.failed_partitions += 1;
            report.errors.push(e.to_string());
        }
    }
}
