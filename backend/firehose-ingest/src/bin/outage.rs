//! Outage simulator
//!
//! Holds an ACCESS EXCLUSIVE lock on `events` for a while so every insert
//! blocks, and times a probe insert issued during the lock. Run it against a
//! live worker to watch entries pile up as pending and drain once the lock is
//! released.
//!
//! Usage: `firehose-outage [SECONDS]` (default 10)
//!
//! Environment variables:
//! - DATABASE_URL: PostgreSQL connection string

use anyhow::{Context, Result};
use chrono::Utc;
use db_pool::{create_pool, PoolRole};
use firehose_ingest::store::{EventStore, PgEventStore};
use firehose_ingest::telemetry::init_tracing;
use serde_json::json;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::{Duration, Instant};
use tracing::info;

const DEFAULT_SECONDS: u64 = 10;
const PROBE_DELAY: Duration = Duration::from_secs(2);

async fn hold_lock(pool: &PgPool, seconds: u64) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("LOCK TABLE events IN ACCESS EXCLUSIVE MODE")
        .execute(&mut *tx)
        .await
        .context("Failed to lock events table")?;
    info!(seconds, "Events table locked; writes are blocked");

    for remaining in (1..=seconds).rev() {
        info!(remaining, "Outage active");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    tx.commit().await?;
    info!("Lock released");
    Ok(())
}

async fn probe_insert(pool: &PgPool) -> Result<Duration> {
    tokio::time::sleep(PROBE_DELAY).await;
    info!("Probe insert issued; expecting it to block");

    let started = Instant::now();
    sqlx::query("INSERT INTO events (user_id, timestamp, metadata) VALUES ($1, $2, $3)")
        .bind(999_i64)
        .bind(Utc::now())
        .bind(Json(json!({"test": "blocked_insert"})))
        .execute(pool)
        .await
        .context("Probe insert failed")?;
    Ok(started.elapsed())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let seconds = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("SECONDS must be a positive integer, got `{}`", raw))?,
        None => DEFAULT_SECONDS,
    };
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let base = db_pool::DbConfig::new("firehose-outage", &database_url).with_env_overrides();

    // Make sure the table exists before locking it.
    let store = PgEventStore::connect_lazy(&base, 1, 1)?;
    store.verify().await?;

    let probe_pool = create_pool(base.for_role(PoolRole::Write, 1)).await?;

    info!(seconds, "Starting database outage simulation");
    let ((), blocked_for) = tokio::try_join!(
        hold_lock(store.pools().writer(), seconds),
        probe_insert(&probe_pool)
    )?;
    info!(
        blocked_secs = blocked_for.as_secs_f64(),
        "Probe insert completed after the lock was released"
    );

    probe_pool.close().await;
    store.close().await;
    Ok(())
}
