//! All-or-nothing persistence of a decoded batch.

use crate::metrics::WorkerMetrics;
use crate::models::{EntryId, Event};
use crate::store::EventStore;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PersistenceBatcher {
    store: Arc<dyn EventStore>,
    metrics: WorkerMetrics,
}

impl PersistenceBatcher {
    pub fn new(store: Arc<dyn EventStore>, metrics: WorkerMetrics) -> Self {
        Self { store, metrics }
    }

    /// Insert every event in one store call and return the ids that are now
    /// durable: all of them, or none.
    pub async fn persist(&self, batch: Vec<(EntryId, Event)>) -> Vec<EntryId> {
        if batch.is_empty() {
            return Vec::new();
        }

        let (ids, events): (Vec<EntryId>, Vec<Event>) = batch.into_iter().unzip();
        let expected = events.len() as u64;

        match self.store.insert_many(&events).await {
            Ok(written) if written == expected => {
                self.metrics.events_persisted.inc_by(written);
                debug!(rows = written, "Batch persisted");
                ids
            }
            Ok(written) => {
                self.metrics.store_failures.inc();
                warn!(
                    expected,
                    written,
                    "Store reported an unexpected row count; batch left pending"
                );
                Vec::new()
            }
            Err(e) => {
                self.metrics.store_failures.inc();
                warn!(
                    error = %e,
                    events = expected,
                    first_entry = %ids[0],
                    "Failed to persist batch; entries left pending"
                );
                Vec::new()
            }
        }
    }
}
