//! Worker configuration read from the environment.

use crate::error::ConfigError;
use crate::lifecycle::StartupPolicy;
use crate::log::ConsumerRef;
use crate::worker::WorkerSettings;
use db_pool::DbConfig;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use validator::Validate;

pub const SERVICE_NAME: &str = "firehose-ingest";

#[derive(Clone, Deserialize, Validate)]
pub struct WorkerConfig {
    #[validate(length(min = 1))]
    pub redis_url: String,

    #[validate(length(min = 1))]
    pub database_url: String,

    /// Log stream the worker consumes
    #[validate(length(min = 1))]
    pub stream_key: String,

    #[validate(length(min = 1))]
    pub consumer_group: String,

    /// This worker's identity within the group; must be stable across restarts
    #[validate(length(min = 1))]
    pub consumer_name: String,

    #[validate(range(min = 1, max = 10000))]
    pub batch_size: usize,

    #[validate(range(min = 1, max = 60000))]
    pub block_ms: u64,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    #[serde(default = "default_store_connect_attempts")]
    #[validate(range(min = 1))]
    pub store_connect_attempts: u32,

    #[serde(default = "default_store_connect_delay_ms")]
    pub store_connect_delay_ms: u64,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_db_read_max_connections")]
    #[validate(range(min = 1))]
    pub db_read_max_connections: u32,

    #[serde(default = "default_db_write_max_connections")]
    #[validate(range(min = 1))]
    pub db_write_max_connections: u32,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_store_connect_attempts() -> u32 {
    5
}

fn default_store_connect_delay_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

fn default_db_read_max_connections() -> u32 {
    4
}

fn default_db_write_max_connections() -> u32 {
    1
}

fn default_http_port() -> u16 {
    8080
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("redis_url", &"[REDACTED]")
            .field("database_url", &"[REDACTED]")
            .field("stream_key", &self.stream_key)
            .field("consumer_group", &self.consumer_group)
            .field("consumer_name", &self.consumer_name)
            .field("batch_size", &self.batch_size)
            .field("block_ms", &self.block_ms)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("error_backoff_ms", &self.error_backoff_ms)
            .field("store_connect_attempts", &self.store_connect_attempts)
            .field("store_connect_delay_ms", &self.store_connect_delay_ms)
            .field("shutdown_timeout_secs", &self.shutdown_timeout_secs)
            .field("db_read_max_connections", &self.db_read_max_connections)
            .field("db_write_max_connections", &self.db_write_max_connections)
            .field("http_port", &self.http_port)
            .finish()
    }
}

impl WorkerConfig {
    /// Load from the process environment.
    ///
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    /// Load from explicit `(NAME, value)` pairs.
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    pub fn consumer(&self) -> ConsumerRef {
        ConsumerRef::new(
            self.stream_key.as_str(),
            self.consumer_group.as_str(),
            self.consumer_name.as_str(),
        )
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            consumer: self.consumer(),
            batch_size: self.batch_size,
            block: Duration::from_millis(self.block_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            error_backoff: Duration::from_millis(self.error_backoff_ms),
        }
    }

    pub fn startup_policy(&self) -> StartupPolicy {
        StartupPolicy {
            attempts: self.store_connect_attempts,
            delay: Duration::from_millis(self.store_connect_delay_ms),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Base pool config; `DB_*` variables override the timeouts.
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(SERVICE_NAME, &self.database_url).with_env_overrides()
    }
}
