//! Firehose Ingest
//!
//! Consumes click events from a Redis stream through a consumer group and
//! persists them to PostgreSQL with at-least-once delivery. An entry is
//! acknowledged only after its row is committed, or once it is known to be
//! undecodable.

pub mod batcher;
pub mod config;
pub mod decoder;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod log;
pub mod metrics;
pub mod models;
pub mod store;
pub mod telemetry;
pub mod worker;

// Public re-exports
pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use lifecycle::{LifecycleController, StartupPolicy};
pub use worker::{WorkerContext, WorkerSettings, WorkerState};
