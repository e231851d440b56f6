//! In-process `EventStore` with injectable outages.

use super::EventStore;
use crate::error::StoreError;
use crate::models::Event;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

pub struct MemoryStore {
    rows: Mutex<Vec<Event>>,
    available: AtomicBool,
    failing_inserts: AtomicU32,
    insert_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            failing_inserts: AtomicU32::new(0),
            insert_calls: AtomicUsize::new(0),
        }
    }

    /// Take the store offline (`false`) or bring it back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` inserts fail after writing nothing.
    pub fn fail_next_inserts(&self, n: u32) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Committed rows in insertion order.
    pub fn rows(&self) -> Vec<Event> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Number of `insert_many` calls, successful or not.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn verify(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn insert_many(&self, events: &[Event]) -> Result<u64, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let failed = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Unavailable("injected insert failure".to_string()));
        }

        self.rows.lock().extend_from_slice(events);
        Ok(events.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventPayload;
    use chrono::Utc;
    use serde_json::Map;

    fn event(user_id: i64) -> Event {
        let bytes = EventPayload::new(user_id, Utc::now(), Map::new())
            .to_bytes()
            .unwrap();
        crate::decoder::decode_payload(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_all_or_nothing() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_many(&[event(1), event(2)]).await.unwrap(), 2);

        store.fail_next_inserts(1);
        assert!(store.insert_many(&[event(3)]).await.is_err());
        assert_eq!(store.len(), 2);

        assert_eq!(store.insert_many(&[event(3)]).await.unwrap(), 1);
        assert_eq!(store.len(), 3);
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn test_offline_store_fails_verify_and_insert() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.verify().await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.insert_many(&[event(1)]).await.is_err());
        assert!(store.is_empty());
    }
}
