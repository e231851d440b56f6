use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RedisTlsMode {
    None,
    Secure,
    Insecure,
}

/// Redis connection pool backed by a reconnecting connection manager.
pub struct RedisPool {
    manager: SharedConnectionManager,
    addr_label: String,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info: ConnectionInfo = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;

        let tls_mode = tls_mode(&info.addr);
        let addr_label = addr_label(&info.addr);

        let client = Client::open(info).context("failed to construct Redis client")?;
        let connection_manager = ConnectionManager::new(client)
            .await
            .context("failed to initialize Redis connection manager")?;

        info!(addr = %addr_label, tls = ?tls_mode, "Redis connection manager initialized");

        Ok(Self {
            manager: Arc::new(Mutex::new(connection_manager)),
            addr_label,
        })
    }

    /// Clone a handle to the multiplexed connection.
    ///
    /// The clone shares the underlying socket, so a blocking command issued on
    /// it does not hold the mutex for its whole duration.
    pub async fn connection(&self) -> ConnectionManager {
        self.manager.lock().await.clone()
    }

    pub fn addr_label(&self) -> &str {
        &self.addr_label
    }
}

fn tls_mode(addr: &ConnectionAddr) -> RedisTlsMode {
    match addr {
        ConnectionAddr::TcpTls { insecure, .. } => {
            if *insecure {
                RedisTlsMode::Insecure
            } else {
                RedisTlsMode::Secure
            }
        }
        _ => RedisTlsMode::None,
    }
}

fn addr_label(addr: &ConnectionAddr) -> String {
    match addr {
        ConnectionAddr::Tcp(host, port) => format!("{}:{}", host, port),
        ConnectionAddr::TcpTls { host, port, .. } => format!("{}:{}", host, port),
        ConnectionAddr::Unix(path) => path.display().to_string(),
        #[allow(unreachable_patterns)]
        _ => "unknown".to_string(),
    }
}
