//! Load generator
//!
//! Appends synthetic click events straight to the ingest stream.
//!
//! Usage: `firehose-load [COUNT]` (default 10000)
//!
//! Environment variables:
//! - REDIS_URL: Redis connection string
//! - STREAM_KEY: stream to append to

use anyhow::{Context, Result};
use chrono::Utc;
use firehose_ingest::log::{EventLog, RedisStreamLog};
use firehose_ingest::models::EventPayload;
use firehose_ingest::telemetry::init_tracing;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Map, Value};
use std::time::Instant;
use tracing::info;

const DEFAULT_COUNT: u64 = 10_000;
const BROWSERS: &[&str] = &["Chrome", "Firefox", "Safari", "Edge"];

fn synthetic_payload(rng: &mut impl Rng) -> Result<Vec<u8>> {
    let mut metadata = Map::new();
    metadata.insert(
        "browser".into(),
        json!(BROWSERS.choose(rng).copied().unwrap_or("Chrome")),
    );
    metadata.insert("version".into(), json!(rng.gen_range(1..=120_u32)));
    metadata.insert("click_x".into(), json!(rng.gen_range(0..=1920_u32)));
    metadata.insert("click_y".into(), json!(rng.gen_range(0..=1080_u32)));
    metadata.insert("action".into(), Value::from("click"));
    metadata.insert("component".into(), Value::from("hero_banner"));

    let payload = EventPayload::new(rng.gen_range(1..=1_000_000_i64), Utc::now(), metadata);
    payload.to_bytes().context("Failed to encode payload")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let count = match std::env::args().nth(1) {
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("COUNT must be a positive integer, got `{}`", raw))?,
        None => DEFAULT_COUNT,
    };
    let redis_url = std::env::var("REDIS_URL").context("REDIS_URL not set")?;
    let stream = std::env::var("STREAM_KEY").context("STREAM_KEY not set")?;

    let log = RedisStreamLog::connect(&redis_url).await?;
    info!(count, stream = %stream, "Appending synthetic events");

    let mut rng = rand::thread_rng();
    let started = Instant::now();
    for sent in 1..=count {
        let payload = synthetic_payload(&mut rng)?;
        log.append(&stream, &payload)
            .await
            .with_context(|| format!("Append failed after {} events", sent - 1))?;
        if sent % 1000 == 0 {
            info!(sent, "Progress");
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    info!(
        count,
        elapsed_secs = elapsed,
        events_per_sec = if elapsed > 0.0 { count as f64 / elapsed } else { 0.0 },
        "Load generation complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use firehose_ingest::decoder::decode_payload;

    #[test]
    fn test_synthetic_payloads_decode() {
        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let event = decode_payload(&synthetic_payload(&mut rng).unwrap()).unwrap();
            assert!((1..=1_000_000).contains(&event.user_id()));
            assert_eq!(event.metadata()["action"], "click");
        }
    }
}
