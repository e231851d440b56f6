//! The claim, decode, persist and acknowledge loop.
//!
//! What is pending or acknowledged lives in the log, so the loop keeps no
//! retry bookkeeping of its own: entries from a failed batch stay in this
//! consumer's pending list and are re-read before any new entries are claimed.

use crate::batcher::PersistenceBatcher;
use crate::decoder::decode_entry;
use crate::error::LogError;
use crate::log::{ConsumerRef, EventLog};
use crate::metrics::WorkerMetrics;
use crate::models::LogEntry;
use crate::store::EventStore;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Tunables for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub consumer: ConsumerRef,
    /// Entries requested per claim
    pub batch_size: usize,
    /// Longest a claim for new entries may wait
    pub block: Duration,
    /// Pause after a batch left entries unresolved
    pub retry_delay: Duration,
    /// Pause after a failed log operation
    pub error_backoff: Duration,
}

/// Everything the loop and the controller share, built once at startup.
#[derive(Clone)]
pub struct WorkerContext {
    pub log: Arc<dyn EventLog>,
    pub store: Arc<dyn EventStore>,
    pub settings: WorkerSettings,
    pub metrics: WorkerMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Recovering,
    Polling,
    Processing,
    Draining,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Recovering => "recovering",
            WorkerState::Polling => "polling",
            WorkerState::Processing => "processing",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        }
    }

    fn code(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one claimed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub claimed: usize,
    pub persisted: usize,
    /// Undecodable entries, acknowledged without being stored
    pub discarded: usize,
    /// Entries neither stored nor discarded; they stay pending
    pub unresolved: usize,
}

pub struct WorkerLoop {
    ctx: WorkerContext,
    batcher: PersistenceBatcher,
    state: watch::Sender<WorkerState>,
    shutdown: CancellationToken,
}

impl WorkerLoop {
    pub fn new(
        ctx: WorkerContext,
        state: watch::Sender<WorkerState>,
        shutdown: CancellationToken,
    ) -> Self {
        let batcher = PersistenceBatcher::new(ctx.store.clone(), ctx.metrics.clone());
        Self {
            ctx,
            batcher,
            state,
            shutdown,
        }
    }

    /// Run until shutdown is requested, then drain and release the log and
    /// store connections.
    #[instrument(skip_all, fields(consumer = %self.ctx.settings.consumer.consumer))]
    pub async fn run(self) {
        let settings = &self.ctx.settings;
        info!(
            stream = %settings.consumer.stream,
            group = %settings.consumer.group,
            batch_size = settings.batch_size,
            block_ms = settings.block.as_millis() as u64,
            "Worker loop starting"
        );

        self.set_state(WorkerState::Recovering);
        match self.drain_pending().await {
            Ok(0) => debug!("No pending entries to recover"),
            Ok(resolved) => info!(resolved, "Recovered entries pending from a previous run"),
            Err(e) => {
                self.ctx.metrics.log_errors.inc();
                warn!(error = %e, "Recovery failed; pending entries will be retried while polling");
            }
        }

        while !self.shutdown.is_cancelled() {
            self.set_state(WorkerState::Polling);
            match self.poll_once().await {
                Ok(outcome) if outcome.unresolved > 0 => {
                    self.pause(self.ctx.settings.retry_delay).await;
                }
                Ok(_) => {}
                Err(e) => {
                    self.ctx.metrics.log_errors.inc();
                    error!(error = %e, transient = e.is_transient(), "Worker loop error");
                    self.pause(self.ctx.settings.error_backoff).await;
                }
            }
        }

        self.set_state(WorkerState::Draining);
        match self.drain_pending().await {
            Ok(resolved) => info!(resolved, "Drained pending entries"),
            Err(e) => {
                self.ctx.metrics.log_errors.inc();
                warn!(error = %e, "Drain failed; entries stay pending for the next run");
            }
        }

        self.ctx.log.close().await;
        self.ctx.store.close().await;
        self.set_state(WorkerState::Stopped);
        info!("Worker loop stopped");
    }

    /// One cycle: re-read this consumer's pending entries, or claim new ones
    /// if there are none, then process whatever came back.
    pub async fn poll_once(&self) -> Result<BatchOutcome, LogError> {
        let consumer = &self.ctx.settings.consumer;
        let batch_size = self.ctx.settings.batch_size;

        let pending = self.ctx.log.claim_pending(consumer, batch_size).await?;
        let batch = if pending.is_empty() {
            self.ctx
                .log
                .claim_new(consumer, batch_size, self.ctx.settings.block)
                .await?
        } else {
            debug!(count = pending.len(), "Re-reading pending entries");
            pending
        };

        if batch.is_empty() {
            return Ok(BatchOutcome::default());
        }

        self.set_state(WorkerState::Processing);
        self.process(batch).await
    }

    /// Decode, persist, then acknowledge every entry that was stored or
    /// discarded.
    #[instrument(skip_all, fields(count = batch.len()))]
    pub async fn process(&self, batch: Vec<LogEntry>) -> Result<BatchOutcome, LogError> {
        let claimed = batch.len();
        self.ctx.metrics.last_batch_size.set(claimed as i64);

        let mut decoded = Vec::with_capacity(claimed);
        let mut resolved = Vec::new();
        for entry in batch {
            match decode_entry(&entry) {
                Ok(event) => decoded.push((entry.id, event)),
                Err(e) => {
                    self.ctx.metrics.decode_failures.inc();
                    warn!(entry_id = %entry.id, error = %e, "Discarding undecodable entry");
                    resolved.push(entry.id);
                }
            }
        }

        let discarded = resolved.len();
        let attempted = decoded.len();
        let persisted = self.batcher.persist(decoded).await;
        let outcome = BatchOutcome {
            claimed,
            persisted: persisted.len(),
            discarded,
            unresolved: attempted - persisted.len(),
        };
        resolved.extend(persisted);

        if !resolved.is_empty() {
            let consumer = &self.ctx.settings.consumer;
            let acked = self
                .ctx
                .log
                .ack(&consumer.stream, &consumer.group, &resolved)
                .await?;
            self.ctx.metrics.entries_acked.inc_by(acked);
            if acked < resolved.len() as u64 {
                debug!(
                    requested = resolved.len(),
                    acked, "Some entries were already acknowledged"
                );
            }
        }

        debug!(
            claimed = outcome.claimed,
            persisted = outcome.persisted,
            discarded = outcome.discarded,
            unresolved = outcome.unresolved,
            "Batch processed"
        );
        Ok(outcome)
    }

    /// Work through this consumer's pending list until it is empty or a batch
    /// cannot be fully resolved. Returns the number of entries resolved.
    async fn drain_pending(&self) -> Result<usize, LogError> {
        let consumer = &self.ctx.settings.consumer;
        let mut resolved = 0;

        loop {
            let batch = self
                .ctx
                .log
                .claim_pending(consumer, self.ctx.settings.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            let outcome = self.process(batch).await?;
            resolved += outcome.persisted + outcome.discarded;
            if outcome.unresolved > 0 {
                warn!(
                    unresolved = outcome.unresolved,
                    "Pending entries could not be persisted"
                );
                break;
            }
        }

        Ok(resolved)
    }

    /// Sleep for `delay`, returning early if shutdown is requested.
    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        self.ctx.metrics.state.set(state.code());
        if previous != state {
            debug!(from = %previous, to = %state, "Worker state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{MemoryLog, StartPosition};
    use crate::models::EventPayload;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use serde_json::Map;

    const STREAM: &str = "events";
    const GROUP: &str = "ingest";

    struct Harness {
        log: Arc<MemoryLog>,
        store: Arc<MemoryStore>,
        worker: WorkerLoop,
        consumer: ConsumerRef,
    }

    async fn harness(name: &str) -> Harness {
        let log = Arc::new(MemoryLog::new());
        log.ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let consumer = ConsumerRef::new(STREAM, GROUP, name);
        let ctx = WorkerContext {
            log: log.clone(),
            store: store.clone(),
            settings: WorkerSettings {
                consumer: consumer.clone(),
                batch_size: 10,
                block: Duration::from_millis(10),
                retry_delay: Duration::from_millis(10),
                error_backoff: Duration::from_millis(10),
            },
            metrics: WorkerMetrics::new(name),
        };
        let (state_tx, _) = watch::channel(WorkerState::Starting);
        let worker = WorkerLoop::new(ctx, state_tx, CancellationToken::new());
        Harness {
            log,
            store,
            worker,
            consumer,
        }
    }

    async fn append_valid(log: &MemoryLog, user_id: i64) {
        let payload = EventPayload::new(user_id, Utc::now(), Map::new())
            .to_bytes()
            .unwrap();
        log.append(STREAM, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_mixed_batch_persists_valid_and_acks_all() {
        let h = harness("worker-mixed").await;
        append_valid(&h.log, 1).await;
        append_valid(&h.log, 2).await;
        h.log.append(STREAM, b"not json").await.unwrap();
        append_valid(&h.log, 3).await;

        let outcome = h.worker.poll_once().await.unwrap();

        assert_eq!(
            outcome,
            BatchOutcome {
                claimed: 4,
                persisted: 3,
                discarded: 1,
                unresolved: 0
            }
        );
        assert_eq!(h.store.len(), 3);
        assert!(h.log.pending_ids(&h.consumer).is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_leaves_valid_entries_pending() {
        let h = harness("worker-outage").await;
        append_valid(&h.log, 1).await;
        h.log.append(STREAM, b"{}").await.unwrap();
        h.store.set_available(false);

        let outcome = h.worker.poll_once().await.unwrap();
        assert_eq!(outcome.unresolved, 1);
        assert_eq!(outcome.discarded, 1);
        assert_eq!(h.log.pending_ids(&h.consumer).len(), 1);

        h.store.set_available(true);
        let outcome = h.worker.poll_once().await.unwrap();
        assert_eq!(outcome.persisted, 1);
        assert!(h.log.pending_ids(&h.consumer).is_empty());
    }

    #[tokio::test]
    async fn test_pending_entries_are_read_before_new_ones() {
        let h = harness("worker-order").await;
        append_valid(&h.log, 1).await;
        h.store.set_available(false);
        h.worker.poll_once().await.unwrap();

        append_valid(&h.log, 2).await;
        h.store.set_available(true);
        h.worker.poll_once().await.unwrap();

        let rows = h.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id(), 1);
    }

    #[tokio::test]
    async fn test_failed_ack_is_reported_and_entries_redelivered() {
        let h = harness("worker-ack").await;
        append_valid(&h.log, 1).await;
        h.log.fail_next_acks(1);

        assert!(h.worker.poll_once().await.is_err());
        assert_eq!(h.store.len(), 1);

        h.worker.poll_once().await.unwrap();
        assert_eq!(h.store.len(), 2);
        assert!(h.log.pending_ids(&h.consumer).is_empty());
    }

    #[tokio::test]
    async fn test_log_outage_surfaces_as_error() {
        let h = harness("worker-log-down").await;
        h.log.set_available(false);
        let err = h.worker.poll_once().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_drain_stops_on_unresolved_batch() {
        let h = harness("worker-drain").await;
        append_valid(&h.log, 1).await;
        h.log
            .claim_new(&h.consumer, 10, Duration::ZERO)
            .await
            .unwrap();
        h.store.set_available(false);

        assert_eq!(h.worker.drain_pending().await.unwrap(), 0);
        assert_eq!(h.log.pending_ids(&h.consumer).len(), 1);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(WorkerState::Draining.to_string(), "draining");
        assert_eq!(
            serde_json::to_value(WorkerState::Polling).unwrap(),
            serde_json::json!("polling")
        );
        assert_eq!(WorkerState::Stopped.code(), 5);
    }
}
