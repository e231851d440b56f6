//! Durable, replayable log consumed through a consumer group.
//!
//! `RedisStreamLog` is the production backend; `MemoryLog` models the same
//! consumer-group semantics in process for tests and local runs.

mod memory;
mod redis_stream;

pub use memory::MemoryLog;
pub use redis_stream::RedisStreamLog;

use crate::error::LogError;
use crate::models::{EntryId, LogEntry};
use async_trait::async_trait;
use std::time::Duration;

/// Identifies one named consumer within a group on a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerRef {
    pub stream: String,
    pub group: String,
    pub consumer: String,
}

impl ConsumerRef {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        }
    }
}

/// Where a newly created group starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver every entry already in the stream
    Beginning,
    /// Deliver only entries appended after group creation
    End,
    /// Deliver entries after the given id
    After(EntryId),
}

impl StartPosition {
    pub fn as_redis_id(&self) -> &str {
        match self {
            StartPosition::Beginning => "0",
            StartPosition::End => "$",
            StartPosition::After(id) => id.as_str(),
        }
    }
}

/// Outcome of `ensure_group`. Both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    Created,
    AlreadyExists,
}

/// Consumer-group log operations used by the worker.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append a payload and return the id the log assigned to it.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<EntryId, LogError>;

    /// Create the group (and the stream) if missing. An existing group is
    /// left untouched, including its cursor.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupStatus, LogError>;

    /// Claim up to `count` entries never delivered to any consumer of the
    /// group, waiting at most `block` for the first one to arrive.
    async fn claim_new(
        &self,
        consumer: &ConsumerRef,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError>;

    /// Re-read up to `count` entries already claimed by this consumer and not
    /// yet acknowledged, oldest first.
    async fn claim_pending(
        &self,
        consumer: &ConsumerRef,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogError>;

    /// Acknowledge entries. Returns how many were newly acknowledged;
    /// unknown or already acknowledged ids are ignored.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError>;

    /// Release connections held by the log.
    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_position_redis_ids() {
        assert_eq!(StartPosition::Beginning.as_redis_id(), "0");
        assert_eq!(StartPosition::End.as_redis_id(), "$");
        assert_eq!(
            StartPosition::After(EntryId::from("5-1")).as_redis_id(),
            "5-1"
        );
    }
}
