//! Durable relational store for decoded events.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgEventStore, MAX_ROWS_PER_STATEMENT};

use crate::error::StoreError;
use crate::models::Event;
use async_trait::async_trait;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Connectivity check plus idempotent schema creation.
    async fn verify(&self) -> Result<(), StoreError>;

    /// Insert every event in one transaction and return the row count.
    ///
    /// Either all rows are committed or none are.
    async fn insert_many(&self, events: &[Event]) -> Result<u64, StoreError>;

    /// Release connections held by the store.
    async fn close(&self) {}
}
