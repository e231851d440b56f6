//! Health and metrics endpoints.

use crate::metrics;
use crate::worker::WorkerState;
use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};
use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info};

type StateWatch = watch::Receiver<WorkerState>;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler));
}

/// 200 while the worker is running or draining, 503 once it has stopped.
async fn health(state: web::Data<StateWatch>) -> HttpResponse {
    let current = *state.borrow();
    let body = json!({
        "status": if current == WorkerState::Stopped { "stopped" } else { "ok" },
        "state": current,
    });

    if current == WorkerState::Stopped {
        HttpResponse::ServiceUnavailable().json(body)
    } else {
        HttpResponse::Ok().json(body)
    }
}

async fn metrics_handler() -> HttpResponse {
    match metrics::render() {
        Ok(text) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(text),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

/// Bind the listener. Process signals are left to the caller.
pub fn serve(state: StateWatch, port: u16) -> std::io::Result<Server> {
    let data = web::Data::new(state);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .workers(1)
        .disable_signals()
        .bind(("0.0.0.0", port))?
        .run();

    info!(port, "Health and metrics listener started");
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};

    async fn get(state: StateWatch, uri: &str) -> (StatusCode, web::Bytes) {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;
        let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
        let status = resp.status();
        (status, test::read_body(resp).await)
    }

    #[actix_web::test]
    async fn test_health_reports_state() {
        let (_tx, rx) = watch::channel(WorkerState::Polling);
        let (status, body) = get(rx, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, json!({"status": "ok", "state": "polling"}));
    }

    #[actix_web::test]
    async fn test_health_unavailable_after_stop() {
        let (_tx, rx) = watch::channel(WorkerState::Stopped);
        let (status, _) = get(rx, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_metrics_exposes_worker_counters() {
        let metrics = crate::metrics::WorkerMetrics::new("http-test");
        metrics.entries_acked.inc();

        let (_tx, rx) = watch::channel(WorkerState::Starting);
        let (status, body) = get(rx, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("firehose_entries_acked_total{consumer=\"http-test\"} 1"));
    }
}
