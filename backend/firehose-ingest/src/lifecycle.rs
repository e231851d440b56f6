//! Startup sequencing and graceful shutdown for the worker loop.

use crate::error::{Result, WorkerError};
use crate::log::StartPosition;
use crate::store::EventStore;
use crate::worker::{WorkerContext, WorkerLoop, WorkerState};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bounded retry policy for reaching the store at boot.
#[derive(Debug, Clone, Copy)]
pub struct StartupPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// Owns the worker task and its shutdown signal.
pub struct LifecycleController {
    shutdown: CancellationToken,
    state: watch::Receiver<WorkerState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleController {
    /// Verify the store, make sure the consumer group exists, then spawn the
    /// worker loop.
    pub async fn start(ctx: WorkerContext, policy: StartupPolicy) -> Result<Self> {
        connect_store(ctx.store.as_ref(), policy).await?;

        let consumer = &ctx.settings.consumer;
        let status = ctx
            .log
            .ensure_group(&consumer.stream, &consumer.group, StartPosition::Beginning)
            .await?;
        info!(
            stream = %consumer.stream,
            group = %consumer.group,
            consumer = %consumer.consumer,
            status = ?status,
            "Consumer group ready"
        );

        let shutdown = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(WorkerState::Starting);
        let worker = WorkerLoop::new(ctx, state_tx, shutdown.clone());
        let handle = tokio::spawn(worker.run());

        Ok(Self {
            shutdown,
            state: state_rx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signal the loop to stop polling and drain. Safe to call repeatedly.
    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// A receiver that follows state changes, for health reporting.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Request shutdown and wait up to `timeout` for the loop to drain and
    /// release its connections.
    ///
    /// On timeout the loop keeps running and a later call may wait again.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.request_shutdown();

        let mut slot = self.handle.lock().await;
        let Some(mut handle) = slot.take() else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => {
                joined?;
                info!("Worker shut down cleanly");
                Ok(())
            }
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "Worker still draining at shutdown deadline"
                );
                *slot = Some(handle);
                Err(WorkerError::ShutdownTimedOut(timeout))
            }
        }
    }
}

/// Call `verify` until it succeeds or the attempts run out.
async fn connect_store(store: &dyn EventStore, policy: StartupPolicy) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match store.verify().await {
            Ok(()) => {
                info!(attempt, "Store reachable");
                return Ok(());
            }
            Err(source) if attempt >= attempts => {
                return Err(WorkerError::StartupFailed { attempts, source });
            }
            Err(e) => {
                warn!(
                    attempt,
                    attempts,
                    retry_in_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "Store not reachable, retrying"
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::log::{ConsumerRef, MemoryLog};
    use crate::metrics::WorkerMetrics;
    use crate::models::Event;
    use crate::store::MemoryStore;
    use crate::worker::WorkerSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Becomes reachable on the given attempt.
    struct FlakyStore {
        ready_on: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventStore for FlakyStore {
        async fn verify(&self) -> std::result::Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.ready_on {
                Ok(())
            } else {
                Err(StoreError::Unavailable("connection refused".into()))
            }
        }

        async fn insert_many(&self, events: &[Event]) -> std::result::Result<u64, StoreError> {
            Ok(events.len() as u64)
        }
    }

    fn policy() -> StartupPolicy {
        StartupPolicy {
            attempts: 3,
            delay: Duration::from_millis(100),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_retries_then_succeeds() {
        let store = FlakyStore {
            ready_on: 3,
            calls: AtomicU32::new(0),
        };
        connect_store(&store, policy()).await.unwrap();
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_retries_exhausted() {
        let store = FlakyStore {
            ready_on: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let err = connect_store(&store, policy()).await.unwrap_err();
        assert!(matches!(err, WorkerError::StartupFailed { attempts: 3, .. }));
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let ctx = WorkerContext {
            log: Arc::new(MemoryLog::new()),
            store: Arc::new(MemoryStore::new()),
            settings: WorkerSettings {
                consumer: ConsumerRef::new("events", "ingest", "lifecycle-idem"),
                batch_size: 10,
                block: Duration::from_millis(20),
                retry_delay: Duration::from_millis(10),
                error_backoff: Duration::from_millis(10),
            },
            metrics: WorkerMetrics::new("lifecycle-idem"),
        };
        let controller = LifecycleController::start(ctx, policy()).await.unwrap();

        controller.request_shutdown();
        controller.request_shutdown();
        controller.shutdown(Duration::from_secs(5)).await.unwrap();
        controller.shutdown(Duration::from_secs(5)).await.unwrap();

        assert_eq!(controller.state(), WorkerState::Stopped);
        assert!(controller.shutdown_token().is_cancelled());
    }
}
