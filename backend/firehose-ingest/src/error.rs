//! Error types for the ingest worker.
//!
//! Each boundary has its own enum: the decoder, the log, the store and the
//! configuration loader. `WorkerError` wraps them for the lifecycle layer.

use std::time::Duration;
use thiserror::Error;

/// Result type for worker-level operations
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Permanent classification of a payload that can never become an `Event`.
///
/// Entries that fail with one of these are acknowledged without being stored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The stream entry carries no `payload` field (or was trimmed)
    #[error("entry has no payload field")]
    MissingPayload,

    /// Payload bytes are not JSON
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// Payload is JSON but not an object
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// A required top-level field is absent or null
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A field is present with the wrong type or an out-of-range value
    #[error("field `{field}` is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    /// The timestamp matched none of the accepted ISO-8601 spellings, or falls
    /// outside the range a `TIMESTAMPTZ` column can hold
    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),
}

/// Errors raised by an `EventLog` implementation.
#[derive(Error, Debug)]
pub enum LogError {
    /// Redis command failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Log could not be reached
    #[error("Log unavailable: {0}")]
    Unavailable(String),

    /// Reply did not have the expected shape
    #[error("Unexpected log reply: {0}")]
    Protocol(String),
}

impl LogError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LogError::Redis(e) => {
                e.is_io_error()
                    || e.is_timeout()
                    || e.is_connection_dropped()
                    || e.is_connection_refusal()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain
                            | redis::ErrorKind::BusyLoadingError
                            | redis::ErrorKind::ClusterDown
                            | redis::ErrorKind::MasterDown
                    )
            }
            LogError::Unavailable(_) => true,
            LogError::Protocol(_) => false,
        }
    }
}

/// Errors raised by an `EventStore` implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store accepted the statement but reported a different row count
    #[error("Partial write: expected {expected} rows, store reported {written}")]
    PartialWrite { expected: u64, written: u64 },
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable missing or unparseable
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    /// Values parsed but violate a constraint
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
}

/// Worker lifecycle errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Store stayed unreachable for every startup attempt
    #[error("Startup failed after {attempts} store connection attempts: {source}")]
    StartupFailed { attempts: u32, source: StoreError },

    /// Shutdown waited for the bound and the loop was still draining
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimedOut(Duration),

    /// The worker task panicked or was aborted
    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
