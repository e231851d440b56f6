//! Redis Streams backend for `EventLog`.
//!
//! Entries carry a single `payload` field. Claims use `XREADGROUP` with `>`
//! for new entries and `0` for this consumer's pending entries list.

use super::{ConsumerRef, EventLog, GroupStatus, StartPosition};
use crate::error::LogError;
use crate::models::{EntryId, LogEntry};
use anyhow::Context;
use async_trait::async_trait;
use redis::{from_redis_value, Value};
use redis_utils::RedisPool;
use std::time::Duration;
use tracing::{debug, info};

/// Stream field holding the JSON document.
pub const PAYLOAD_FIELD: &str = "payload";

pub struct RedisStreamLog {
    pool: RedisPool,
}

impl RedisStreamLog {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let pool = RedisPool::connect(redis_url)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::new(pool))
    }

    async fn read_group(
        &self,
        consumer: &ConsumerRef,
        count: usize,
        block: Option<Duration>,
        start_id: &str,
    ) -> Result<Vec<LogEntry>, LogError> {
        let mut conn = self.pool.connection().await;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&consumer.group)
            .arg(&consumer.consumer)
            .arg("COUNT")
            .arg(count.max(1));
        if let Some(block) = block {
            // BLOCK 0 waits forever; never send it.
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&consumer.stream).arg(start_id);

        let reply: Value = cmd.query_async(&mut conn).await?;
        parse_read_reply(&reply)
    }
}

#[async_trait]
impl EventLog for RedisStreamLog {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<EntryId, LogError> {
        let mut conn = self.pool.connection().await;
        let id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(EntryId::from(id))
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupStatus, LogError> {
        let mut conn = self.pool.connection().await;
        let result = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start.as_redis_id())
            .arg("MKSTREAM")
            .query_async::<_, ()>(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Consumer group created");
                Ok(GroupStatus::Created)
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                info!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(GroupStatus::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn claim_new(
        &self,
        consumer: &ConsumerRef,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.read_group(consumer, count, Some(block), ">").await
    }

    async fn claim_pending(
        &self,
        consumer: &ConsumerRef,
        count: usize,
    ) -> Result<Vec<LogEntry>, LogError> {
        self.read_group(consumer, count, None, "0").await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, LogError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.pool.connection().await;
        let acked: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids.iter().map(EntryId::as_str).collect::<Vec<_>>())
            .query_async(&mut conn)
            .await?;

        debug!(requested = ids.len(), acked, "XACK");
        Ok(acked)
    }

    async fn close(&self) {
        // The multiplexed connection drops with the last handle to this log.
        info!(addr = %self.pool.addr_label(), "Redis log closed");
    }
}

/// Parse an `XREADGROUP` reply into entries.
///
/// A nil reply means the block timed out. A nil or empty field list means the
/// entry is still pending but was trimmed from the stream.
fn parse_read_reply(reply: &Value) -> Result<Vec<LogEntry>, LogError> {
    // A Vec of tuples would be read as a flat k/v list, so each stream
    // element is converted on its own.
    let streams: Option<Vec<Value>> = from_redis_value(reply)
        .map_err(|e| LogError::Protocol(format!("XREADGROUP reply: {}", e)))?;

    let mut entries = Vec::new();
    for stream in streams.unwrap_or_default() {
        let (_stream, raw_entries): (String, Vec<Value>) = from_redis_value(&stream)
            .map_err(|e| LogError::Protocol(format!("XREADGROUP stream: {}", e)))?;
        for raw in &raw_entries {
            let (id, fields): (String, Option<Vec<Vec<u8>>>) = from_redis_value(raw)
                .map_err(|e| LogError::Protocol(format!("stream entry: {}", e)))?;

            entries.push(LogEntry {
                id: EntryId::from(id),
                payload: fields.and_then(payload_field),
            });
        }
    }
    Ok(entries)
}

fn payload_field(fields: Vec<Vec<u8>>) -> Option<Vec<u8>> {
    fields
        .chunks_exact(2)
        .find(|pair| pair[0] == PAYLOAD_FIELD.as_bytes())
        .map(|pair| pair[1].clone())
}
