//! Crawl orchestrator - the resumable harvest loop
//!
//! This module drives one job over one universe:
//! - Consulting the checkpoint ledger for the items still to do
//! - Dispatching them in universe order to a bounded worker pool
//! - Fetching, parsing and persisting each item
//! - Recording every outcome in the ledger as it happens
//! - Stopping cooperatively on cancellation, or on a run-level failure

use crate::checkpoint::CheckpointLedger;
use crate::crawler::endpoint::Endpoint;
use crate::crawler::{FetchError, Fetcher, Payload};
use crate::output::RunStatistics;
use crate::state::{ItemDescriptor, Universe};
use crate::storage::{AppendOutcome, RecordStore};
use crate::{HarvestError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How the ledger is treated before the run starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Process only items that are not done yet
    #[default]
    Resume,
    /// Reset the universe's records to pending first
    ForceRefresh,
}

/// Result of one run, including partial runs
#[derive(Debug, Clone)]
pub struct RunReport {
    pub job: String,
    pub stats: RunStatistics,
    /// Reason for a run-level abort
    pub abort: Option<String>,
}

impl RunReport {
    pub fn is_aborted(&self) -> bool {
        self.abort.is_some()
    }

    /// Turns an aborted run into `HarvestError::RunAborted`
    pub fn into_result(self) -> Result<RunStatistics> {
        match self.abort {
            Some(reason) => Err(HarvestError::RunAborted {
                completed: self.stats.succeeded,
                reason,
            }),
            None => Ok(self.stats),
        }
    }
}

/// What happened to one item
enum ItemOutcome {
    Done(AppendOutcome),
    Failed(String),
    /// Item is failed and no further items may start
    Abort(String),
}

/// State shared by every worker of one run
struct RunContext {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn RecordStore>,
    ledger: Arc<CheckpointLedger>,
    endpoint: Arc<dyn Endpoint>,
    queue: Mutex<VecDeque<ItemDescriptor>>,
    stats: Mutex<RunStatistics>,
    abort: Mutex<Option<String>>,
    /// Cancelled by the caller's token or by an abort
    stop: CancellationToken,
    finished: AtomicU64,
    total: u64,
    started: Instant,
}

/// Drives one endpoint over a universe of items
pub struct Orchestrator {
    fetcher: Arc<Fetcher>,
    store: Arc<dyn RecordStore>,
    ledger: Arc<CheckpointLedger>,
    endpoint: Arc<dyn Endpoint>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator
    ///
    /// # Arguments
    ///
    /// * `fetcher` - Shared fetcher (owns the credential store and rate gate)
    /// * `store` - Storage backend receiving parsed rows
    /// * `ledger` - Checkpoint ledger opened for `endpoint.job_name()`
    /// * `endpoint` - Request builder and parser for the job
    /// * `concurrency` - Worker count, at least 1
    pub fn new(
        fetcher: Arc<Fetcher>,
        store: Arc<dyn RecordStore>,
        ledger: Arc<CheckpointLedger>,
        endpoint: Arc<dyn Endpoint>,
        concurrency: usize,
    ) -> Self {
        if ledger.job() != endpoint.job_name() {
            tracing::warn!(
                ledger_job = ledger.job(),
                endpoint_job = %endpoint.job_name(),
                "Ledger and endpoint job names differ"
            );
        }

        Self {
            fetcher,
            store,
            ledger,
            endpoint,
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` as the cooperative stop signal
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the job over `universe`
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The run finished, was cancelled, or aborted; the
    ///   report says which and carries the statistics either way
    /// * `Err(HarvestError)` - The ledger could not be prepared
    pub async fn run(&self, universe: &Universe, mode: RunMode) -> Result<RunReport> {
        let job = self.endpoint.job_name();
        let started = Instant::now();

        if mode == RunMode::ForceRefresh {
            let reset = self.ledger.reset(universe.ids())?;
            tracing::info!(job = %job, reset, "Force refresh: records reset to pending");
        }

        self.ledger.load()?;
        let pending = self.ledger.pending_items(universe)?;
        let skipped = (universe.len() - pending.len()) as u64;

        tracing::info!(
            job = %job,
            universe = universe.len(),
            pending = pending.len(),
            skipped,
            workers = self.concurrency.min(pending.len()),
            "Starting run"
        );

        let context = Arc::new(RunContext {
            fetcher: self.fetcher.clone(),
            store: self.store.clone(),
            ledger: self.ledger.clone(),
            endpoint: self.endpoint.clone(),
            total: pending.len() as u64,
            queue: Mutex::new(pending.into()),
            stats: Mutex::new(RunStatistics {
                skipped,
                ..RunStatistics::default()
            }),
            abort: Mutex::new(None),
            stop: self.cancel.child_token(),
            finished: AtomicU64::new(0),
            started,
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency.min(context.total as usize) {
            let context = context.clone();
            workers.spawn(async move { run_worker(worker, context).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task failed");
                abort_run(&context, format!("worker task failed: {}", e)).await;
            }
        }

        let abort = context.abort.lock().await.clone();
        let mut stats = context.stats.lock().await.clone();
        stats.elapsed = started.elapsed();
        stats.cancelled = self.cancel.is_cancelled();
        stats.aborted = abort.is_some();

        if let Some(reason) = &abort {
            tracing::error!(job = %job, reason = %reason, completed = stats.succeeded, "Run aborted");
        } else if stats.cancelled {
            let remaining = context.queue.lock().await.len();
            tracing::warn!(job = %job, remaining, "Run cancelled");
        }
        stats.log_summary(&job);

        Ok(RunReport { job, stats, abort })
    }
}

async fn abort_run(context: &RunContext, reason: String) {
    let mut abort = context.abort.lock().await;
    if abort.is_none() {
        *abort = Some(reason);
    }
    context.stop.cancel();
}

async fn run_worker(worker: usize, context: Arc<RunContext>) {
    tracing::debug!(worker, "Worker started");

    loop {
        // Checked between items only; an item in flight always finishes
        if context.stop.is_cancelled() {
            break;
        }
        let Some(item) = context.queue.lock().await.pop_front() else {
            break;
        };

        let outcome = process_item(&context, &item).await;
        let outcome = finalize(&context, &item, outcome);

        {
            let mut stats = context.stats.lock().await;
            match &outcome {
                ItemOutcome::Done(rows) => {
                    stats.succeeded += 1;
                    stats.record_rows(rows);
                }
                ItemOutcome::Failed(_) | ItemOutcome::Abort(_) => stats.failed += 1,
            }
        }

        if let ItemOutcome::Abort(reason) = outcome {
            abort_run(&context, reason).await;
        }

        report_progress(&context).await;
    }

    tracing::debug!(worker, "Worker stopped");
}

/// Fetches, parses and stores one item
async fn process_item(context: &RunContext, item: &ItemDescriptor) -> ItemOutcome {
    if let Err(e) = context.ledger.mark_in_progress(&item.id) {
        return ItemOutcome::Abort(format!("checkpoint ledger write failed: {}", e));
    }
    context.stats.lock().await.attempted += 1;

    let endpoint = &context.endpoint;

    let payload = match fetch_item(context, item).await {
        Ok(payload) => payload,
        Err(FetchError::AuthUnavailable(e)) => {
            tracing::error!(item = %item.id, error = %e, "Authentication unavailable");
            return ItemOutcome::Abort(format!("authentication unavailable: {}", e));
        }
        Err(e) => {
            tracing::warn!(item = %item.id, kind = e.label(), error = %e, "Fetch failed");
            return ItemOutcome::Failed(format!("{}: {}", e.label(), e));
        }
    };

    let records = match endpoint.parse(item, &payload) {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(item = %item.id, error = %e, "Parse failed");
            return ItemOutcome::Failed(format!("{}: {}", e.label(), e));
        }
    };

    if records.is_empty() {
        tracing::debug!(item = %item.id, "No rows in response");
        return ItemOutcome::Done(AppendOutcome::default());
    }

    let store = context.store.clone();
    let table = endpoint.table().to_string();
    let key = endpoint.unique_key();
    let appended =
        tokio::task::spawn_blocking(move || store.append_deduplicated(&records, &table, &key)).await;

    match appended {
        Ok(Ok(outcome)) => {
            tracing::debug!(
                item = %item.id,
                inserted = outcome.inserted,
                skipped = outcome.skipped_duplicates,
                replaced = outcome.replaced,
                "Rows stored"
            );
            ItemOutcome::Done(outcome)
        }
        Ok(Err(e)) if e.is_fatal() => ItemOutcome::Abort(format!("storage failure: {}", e)),
        Ok(Err(e)) => {
            if e.is_transient() {
                tracing::warn!(item = %item.id, error = %e, "Transient storage failure");
            } else {
                tracing::warn!(item = %item.id, error = %e, "Rows rejected by storage");
            }
            ItemOutcome::Failed(format!("storage: {}", e))
        }
        Err(e) => ItemOutcome::Abort(format!("storage task failed: {}", e)),
    }
}

/// Fetches from the endpoint's primary location, then its fallback if the
/// primary one rejects the item or answers in an unexpected shape
async fn fetch_item(
    context: &RunContext,
    item: &ItemDescriptor,
) -> std::result::Result<Payload, FetchError> {
    let endpoint = &context.endpoint;
    let kind = endpoint.kind();

    match context.fetcher.fetch(kind, &endpoint.params(item)).await {
        Err(e @ (FetchError::PermanentRejected { .. } | FetchError::MalformedResponse(_))) => {
            let Some(fallback) = endpoint.fallback(item) else {
                return Err(e);
            };
            tracing::debug!(item = %item.id, path = fallback.path, error = %e, "Trying fallback location");
            context
                .fetcher
                .fetch_from(kind, fallback.host, fallback.path, &fallback.params)
                .await
        }
        other => other,
    }
}

/// Records the outcome in the ledger; a ledger failure aborts the run
fn finalize(context: &RunContext, item: &ItemDescriptor, outcome: ItemOutcome) -> ItemOutcome {
    let written = match &outcome {
        ItemOutcome::Done(_) => context.ledger.mark_done(&item.id),
        ItemOutcome::Failed(reason) | ItemOutcome::Abort(reason) => {
            context.ledger.mark_failed(&item.id, reason)
        }
    };

    match written {
        Ok(()) => outcome,
        Err(e) => {
            tracing::error!(item = %item.id, error = %e, "Checkpoint ledger write failed");
            ItemOutcome::Abort(format!("checkpoint ledger write failed: {}", e))
        }
    }
}

async fn report_progress(context: &RunContext) {
    let finished = context.finished.fetch_add(1, Ordering::SeqCst) + 1;
    if finished % 10 != 0 && finished != context.total {
        return;
    }

    let elapsed = context.started.elapsed().as_secs_f64();
    let rate = if elapsed > 0.0 {
        finished as f64 / elapsed
    } else {
        0.0
    };
    let stats = context.stats.lock().await;
    tracing::info!(
        finished,
        total = context.total,
        succeeded = stats.succeeded,
        failed = stats.failed,
        "Progress: {:.2} items/sec",
        rate
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_into_result() {
        let ok = RunReport {
            job: "kline:day:after".to_string(),
            stats: RunStatistics {
                attempted: 2,
                succeeded: 2,
                ..RunStatistics::default()
            },
            abort: None,
        };
        assert_eq!(ok.into_result().unwrap().succeeded, 2);

        let aborted = RunReport {
            job: "company".to_string(),
            stats: RunStatistics {
                succeeded: 4,
                aborted: true,
                ..RunStatistics::default()
            },
            abort: Some("authentication unavailable".to_string()),
        };
        assert!(aborted.is_aborted());
        assert!(matches!(
            aborted.into_result(),
            Err(HarvestError::RunAborted { completed: 4, .. })
        ));
    }
}
