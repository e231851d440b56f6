//! In-process `EventLog` with Redis consumer-group semantics.
//!
//! Each group keeps a delivery cursor and a pending entries list keyed by
//! consumer. Fault injection hooks let tests take the log offline or fail the
//! next acknowledgments.

use super::{ConsumerRef, EventLog, GroupStatus, StartPosition};
use crate::error::LogError;
use crate::models::{EntryId, LogEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Default)]
struct StreamState {
    last_seq: u64,
    entries: BTreeMap<u64, Vec<u8>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingInfo>,
}

struct PendingInfo {
    consumer: String,
    deliveries: u32,
}

pub struct MemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    available: AtomicBool,
    failing_acks: AtomicU32,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            appended: Notify::new(),
            available: AtomicBool::new(true),
            failing_acks: AtomicU32::new(0),
        }
    }

    /// Take the log offline (`false`) or bring it back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `ack` fail without acknowledging anything.
    pub fn fail_next_acks(&self, n: u32) {
        self.failing_acks.store(n, Ordering::SeqCst);
    }

    /// Drop an entry's body while leaving any pending claim on it.
    pub fn trim_entry(&self, stream: &str, id: &EntryId) {
        if let Some(seq) = parse_seq(id) {
            if let Some(state) = self.streams.lock().get_mut(stream) {
                state.entries.remove(&seq);
            }
        }
    }

    /// Ids pending for one consumer, oldest first.
    pub fn pending_ids(&self, consumer: &ConsumerRef) -> Vec<EntryId> {
        let streams = self.streams.lock();
        streams
            .get(&consumer.stream)
            .and_then(|s| s.groups.get(&consumer.group))
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, info)| info.consumer == consumer.consumer)
                    .map(|(seq, _)| entry_id(*seq))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// How many times an entry has been handed out, if it is pending.
    pub fn delivery_count(&self, stream: &str, group: &str, id: &EntryId) -> Option<u32> {
        let seq = parse_seq(id)?;
        let streams = self.streams.lock();
        streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&seq)
            .map(|info| info.deliveries)
    }

    /// An entry is acknowledged once it was delivered and left the pending list.
    pub fn is_acknowledged(&self, stream: &str, group: &str, id: &EntryId) -> bool {
        let Some(seq) = parse_seq(id) else {
            return false;
        };
        let streams = self.streams.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| seq <= g.last_delivered && !g.pending.contains_key(&seq))
            .unwrap_or(false)
    }

    /// The group's delivery cursor.
    pub fn last_delivered(&self, stream: &str, group: &str) -> Option<EntryId> {
        let streams = self.streams.lock();
        let g = streams.get(stream)?.groups.get(group)?;
        (g.last_delivered > 0).then(|| entry_id(g.last_delivered))
    }

    fn check_available(&self) -> Result<(), LogError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LogError::Unavailable("memory log is offline".to_string()))
        }
    }

    fn try_claim_new(
        &self,
        consumer: &ConsumerRef,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(&consumer.stream)
            .ok_or_else(|| no_group(consumer))?;
        let group = state
            .groups
            .get_mut(&consumer.group)
            .ok_or_else(|| no_group(consumer))?;

        let fresh: Vec<(u64, Vec<u8>)> = state
            .entries
            .range(group.last_delivered + 1..)
            .take(count.max(1))
            .map(|(seq, payload)| (*seq, payload.clone()))
            .collect();

        let mut claimed = Vec::with_capacity(fresh.len());
        for (seq, payload) in fresh {
            group.last_delivered = seq;
            group.pending.insert(
                seq,
                PendingInfo {
                    consumer: consumer.consumer.clone(),
                    deliveries: 1,
                },
            );
            claimed.push(LogEntry::new(entry_id(seq), payload));
        }
        Ok(claimed)
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<EntryId, LogError> {
        self.check_available()?;
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.last_seq += 1;
            state.entries.insert(state.last_seq, payload.to_vec());
            entry_id(state.last_seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupStatus, LogError> {
        self.check_available()?;
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(GroupStatus::AlreadyExists);
        }

        let last_delivered = match &start {
            StartPosition::Beginning => 0,
            StartPosition::End => state.last_seq,
            StartPosition::After(id) => parse_seq(id).ok_or_else(|| {
                LogError::Protocol(format!("invalid start id `{}`", id))
            })?,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(GroupStatus::Created)
    }

    async fn claim_new(
        &self,
        consumer: &ConsumerRef,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.check_available()?;
            let claimed = self.try_claim_new(consumer, count)?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_pending(
        &self,
        consumer: &ConsumerRef,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.check_available()?;
        let mut streams = self.streams.lock();
        let state = streams
            .get_mut(&consumer.stream)
            .ok_or_else(|| no_group(consumer))?;
        let group = state
            .groups
            .get_mut(&consumer.group)
            .ok_or_else(|| no_group(consumer))?;

        let mut claimed = Vec::new();
        for (seq, info) in group
            .pending
            .iter_mut()
            .filter(|(_, info)| info.consumer == consumer.consumer)
            .take(count.max(1))
        {
            info.deliveries += 1;
            claimed.push(LogEntry {
                id: entry_id(*seq),
                payload: state.entries.get(seq).cloned(),
            });
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
        self.check_available()?;
        let failed = self
            .failing_acks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(LogError::Unavailable("injected ack failure".to_string()));
        }

        let mut streams = self.streams.lock();
        let Some(g) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter_map(parse_seq)
            .filter(|seq| g.pending.remove(seq).is_some())
            .count();
        Ok(acked as u64)
    }
}

fn entry_id(seq: u64) -> EntryId {
    EntryId::new(format!("0-{}", seq))
}

fn parse_seq(id: &EntryId) -> Option<u64> {
    id.as_str().strip_prefix("0-")?.parse().ok()
}

fn no_group(consumer: &ConsumerRef) -> LogError {
    LogError::Protocol(format!(
        "NOGROUP no consumer group `{}` for stream `{}`",
        consumer.group, consumer.stream
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = "events";
    const GROUP: &str = "workers";

    fn consumer(name: &str) -> ConsumerRef {
        ConsumerRef::new(STREAM, GROUP, name)
    }

    async fn log_with_group() -> MemoryLog {
        let log = MemoryLog::new();
        log.ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();
        log
    }

    #[tokio::test]
    async fn test_claim_new_delivers_each_entry_once() {
        let log = log_with_group().await;
        for i in 0..3 {
            log.append(STREAM, format!("{i}").as_bytes()).await.unwrap();
        }

        let a = log.claim_new(&consumer("a"), 2, Duration::ZERO).await.unwrap();
        let b = log.claim_new(&consumer("b"), 10, Duration::ZERO).await.unwrap();
        let again = log.claim_new(&consumer("a"), 10, Duration::ZERO).await.unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(again.is_empty());
        assert_eq!(log.pending_ids(&consumer("a")).len(), 2);
        assert_eq!(log.pending_ids(&consumer("b")).len(), 1);
    }

    #[tokio::test]
    async fn test_claim_pending_only_returns_own_entries() {
        let log = log_with_group().await;
        log.append(STREAM, b"one").await.unwrap();
        log.append(STREAM, b"two").await.unwrap();
        log.claim_new(&consumer("a"), 1, Duration::ZERO).await.unwrap();
        log.claim_new(&consumer("b"), 1, Duration::ZERO).await.unwrap();

        let pending = log.claim_pending(&consumer("a"), 10).await.unwrap();
        assert_eq!(pending, vec![LogEntry::new("0-1", b"one".to_vec())]);
        assert_eq!(
            log.delivery_count(STREAM, GROUP, &EntryId::from("0-1")),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let log = log_with_group().await;
        let id = log.append(STREAM, b"x").await.unwrap();
        log.claim_new(&consumer("a"), 1, Duration::ZERO).await.unwrap();

        assert_eq!(log.ack(STREAM, GROUP, &[id.clone()]).await.unwrap(), 1);
        assert_eq!(log.ack(STREAM, GROUP, &[id.clone()]).await.unwrap(), 0);
        assert!(log.is_acknowledged(STREAM, GROUP, &id));
        assert!(log.pending_ids(&consumer("a")).is_empty());
    }

    #[tokio::test]
    async fn test_ensure_group_twice_keeps_cursor() {
        let log = log_with_group().await;
        log.append(STREAM, b"x").await.unwrap();
        log.claim_new(&consumer("a"), 1, Duration::ZERO).await.unwrap();

        let status = log
            .ensure_group(STREAM, GROUP, StartPosition::Beginning)
            .await
            .unwrap();

        assert_eq!(status, GroupStatus::AlreadyExists);
        assert_eq!(log.last_delivered(STREAM, GROUP), Some(EntryId::from("0-1")));
    }

    #[tokio::test]
    async fn test_group_at_end_skips_backlog() {
        let log = MemoryLog::new();
        log.append(STREAM, b"old").await.unwrap();
        log.ensure_group(STREAM, GROUP, StartPosition::End)
            .await
            .unwrap();
        log.append(STREAM, b"new").await.unwrap();

        let claimed = log.claim_new(&consumer("a"), 10, Duration::ZERO).await.unwrap();
        assert_eq!(claimed, vec![LogEntry::new("0-2", b"new".to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_new_blocks_until_append() {
        let log = std::sync::Arc::new(log_with_group().await);
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append(STREAM, b"late").await.unwrap();
        });

        let claimed = log
            .claim_new(&consumer("a"), 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_new_times_out_empty() {
        let log = log_with_group().await;
        let started = Instant::now();
        let claimed = log
            .claim_new(&consumer("a"), 10, Duration::from_millis(200))
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_trimmed_pending_entry_has_no_payload() {
        let log = log_with_group().await;
        let id = log.append(STREAM, b"x").await.unwrap();
        log.claim_new(&consumer("a"), 1, Duration::ZERO).await.unwrap();
        log.trim_entry(STREAM, &id);

        let pending = log.claim_pending(&consumer("a"), 1).await.unwrap();
        assert_eq!(pending, vec![LogEntry::trimmed(id)]);
    }

    #[tokio::test]
    async fn test_offline_log_and_injected_ack_failures() {
        let log = log_with_group().await;
        let id = log.append(STREAM, b"x").await.unwrap();
        log.claim_new(&consumer("a"), 1, Duration::ZERO).await.unwrap();

        log.fail_next_acks(1);
        assert!(log.ack(STREAM, GROUP, &[id.clone()]).await.is_err());
        assert_eq!(log.pending_ids(&consumer("a")), vec![id.clone()]);

        log.set_available(false);
        assert!(log.claim_pending(&consumer("a"), 1).await.is_err());
        log.set_available(true);
        assert_eq!(log.ack(STREAM, GROUP, &[id]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_group_is_protocol_error() {
        let log = MemoryLog::new();
        let err = log
            .claim_new(&consumer("a"), 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::Protocol(_)));
    }
}
