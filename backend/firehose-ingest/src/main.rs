//! Firehose ingest worker
//!
//! Environment variables: see `WorkerConfig`. `RUST_LOG` and `LOG_FORMAT`
//! control logging.

use anyhow::Context;
use firehose_ingest::config::WorkerConfig;
use firehose_ingest::http;
use firehose_ingest::log::RedisStreamLog;
use firehose_ingest::metrics::WorkerMetrics;
use firehose_ingest::store::PgEventStore;
use firehose_ingest::telemetry::init_tracing;
use firehose_ingest::{LifecycleController, WorkerContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const POOL_METRICS_INTERVAL: Duration = Duration::from_secs(15);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting firehose ingest worker");

    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    info!(config = ?config, "Configuration loaded");

    let log = RedisStreamLog::connect(&config.redis_url).await?;
    let store = PgEventStore::connect_lazy(
        &config.db_config(),
        config.db_read_max_connections,
        config.db_write_max_connections,
    )
    .context("Failed to build database pools")?;
    let pool_metrics = store.pools().spawn_metrics_updater(POOL_METRICS_INTERVAL);

    let ctx = WorkerContext {
        log: Arc::new(log),
        store: Arc::new(store),
        settings: config.worker_settings(),
        metrics: WorkerMetrics::new(&config.consumer_name),
    };

    let controller = LifecycleController::start(ctx, config.startup_policy())
        .await
        .context("Worker failed to start")?;

    let server = http::serve(controller.subscribe(), config.http_port)
        .context("Failed to bind health listener")?;
    let server_handle = server.handle();
    let server_task = actix_rt::spawn(server);

    shutdown_signal().await;
    info!("Shutdown signal received");

    let result = controller.shutdown(config.shutdown_timeout()).await;
    if let Err(e) = &result {
        error!(error = %e, "Worker did not shut down cleanly");
    }

    server_handle.stop(true).await;
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health listener failed"),
        Err(e) => error!(error = %e, "Health listener task failed"),
    }
    pool_metrics.abort();

    result.context("Shutdown failed")?;
    info!("Firehose ingest worker stopped");
    Ok(())
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
