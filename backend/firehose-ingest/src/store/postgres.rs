//! PostgreSQL `EventStore` over separate read and write pools.

use super::EventStore;
use crate::error::StoreError;
use crate::models::Event;
use async_trait::async_trait;
use db_pool::{acquire_with_metrics, DbConfig, DbPools};
use sqlx::types::Json;
use sqlx::{Connection, Postgres, QueryBuilder};
use std::time::Duration;
use tracing::{debug, info, warn};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL
    )
"#;

/// PostgreSQL caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;
const COLUMNS_PER_ROW: usize = 3;

/// Rows per `INSERT` statement; larger batches are split inside one transaction.
pub const MAX_ROWS_PER_STATEMENT: usize = MAX_BIND_PARAMS / COLUMNS_PER_ROW;

pub struct PgEventStore {
    pools: DbPools,
    verify_timeout: Duration,
}

impl PgEventStore {
    pub fn new(pools: DbPools, verify_timeout: Duration) -> Self {
        Self {
            pools,
            verify_timeout,
        }
    }

    /// Build lazily connecting pools; nothing touches the network until `verify`.
    pub fn connect_lazy(
        base: &DbConfig,
        read_max_connections: u32,
        write_max_connections: u32,
    ) -> Result<Self, StoreError> {
        let pools = DbPools::connect_lazy(base, read_max_connections, write_max_connections)?;
        Ok(Self::new(
            pools,
            Duration::from_secs(base.connect_timeout_secs),
        ))
    }

    pub fn pools(&self) -> &DbPools {
        &self.pools
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn verify(&self) -> Result<(), StoreError> {
        db_pool::verify(self.pools.reader(), self.pools.read_label(), self.verify_timeout).await?;
        sqlx::query(SCHEMA).execute(self.pools.writer()).await?;
        self.pools.record_metrics();
        info!("Database verified and events table ensured");
        Ok(())
    }

    async fn insert_many(&self, events: &[Event]) -> Result<u64, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }

        let expected = events.len() as u64;
        let mut conn = acquire_with_metrics(self.pools.writer(), self.pools.write_label()).await?;
        let mut tx = conn.begin().await?;

        let mut written = 0u64;
        for chunk in events.chunks(MAX_ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO events (user_id, timestamp, metadata) ");
            builder.push_values(chunk, |mut row, event| {
                row.push_bind(event.user_id())
                    .push_bind(event.timestamp())
                    .push_bind(Json(event.metadata().clone()));
            });

            let result = builder.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }

        if written != expected {
            warn!(expected, written, "Row count mismatch, rolling back batch");
            tx.rollback().await?;
            return Err(StoreError::PartialWrite { expected, written });
        }

        tx.commit().await?;
        debug!(rows = written, "Batch committed");
        Ok(written)
    }

    async fn close(&self) {
        self.pools.close().await;
    }
}
