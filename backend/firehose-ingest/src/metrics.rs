use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Worker counters and gauges, registered on the default registry.
///
/// Labelled with the consumer name so several workers can share one scrape
/// target.
#[derive(Clone)]
pub struct WorkerMetrics {
    pub events_persisted: IntCounter,
    pub entries_acked: IntCounter,
    pub decode_failures: IntCounter,
    pub store_failures: IntCounter,
    pub log_errors: IntCounter,
    pub last_batch_size: IntGauge,
    pub state: IntGauge,
}

impl WorkerMetrics {
    pub fn new(consumer: &str) -> Self {
        let registry = prometheus::default_registry();
        let opts = |name: &str, help: &str| {
            Opts::new(name, help).const_label("consumer", consumer.to_string())
        };

        let events_persisted = IntCounter::with_opts(opts(
            "firehose_events_persisted_total",
            "Events committed to the store",
        ))
        .expect("valid metric opts for firehose_events_persisted_total");

        let entries_acked = IntCounter::with_opts(opts(
            "firehose_entries_acked_total",
            "Log entries acknowledged (persisted or discarded)",
        ))
        .expect("valid metric opts for firehose_entries_acked_total");

        let decode_failures = IntCounter::with_opts(opts(
            "firehose_decode_failures_total",
            "Entries discarded because the payload could not be decoded",
        ))
        .expect("valid metric opts for firehose_decode_failures_total");

        let store_failures = IntCounter::with_opts(opts(
            "firehose_store_failures_total",
            "Batches the store rejected; entries stay pending",
        ))
        .expect("valid metric opts for firehose_store_failures_total");

        let log_errors = IntCounter::with_opts(opts(
            "firehose_log_errors_total",
            "Failed log operations that triggered a backoff",
        ))
        .expect("valid metric opts for firehose_log_errors_total");

        let last_batch_size = IntGauge::with_opts(opts(
            "firehose_last_batch_size",
            "Entries in the most recently processed batch",
        ))
        .expect("valid metric opts for firehose_last_batch_size");

        let state = IntGauge::with_opts(opts(
            "firehose_worker_state",
            "Current worker state (0=starting 1=recovering 2=polling 3=processing 4=draining 5=stopped)",
        ))
        .expect("valid metric opts for firehose_worker_state");

        for metric in [
            Box::new(events_persisted.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(entries_acked.clone()),
            Box::new(decode_failures.clone()),
            Box::new(store_failures.clone()),
            Box::new(log_errors.clone()),
            Box::new(last_batch_size.clone()),
            Box::new(state.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register worker metric: {}", e);
            }
        }

        Self {
            events_persisted,
            entries_acked,
            decode_failures,
            store_failures,
            log_errors,
            last_batch_size,
            state,
        }
    }
}

/// Render every metric in the default registry in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_with_consumer_label() {
        let metrics = WorkerMetrics::new("render-test");
        metrics.events_persisted.inc_by(3);

        let text = render().unwrap();
        assert!(text.contains("firehose_events_persisted_total{consumer=\"render-test\"} 3"));
    }

    #[test]
    fn test_duplicate_registration_is_tolerated() {
        let first = WorkerMetrics::new("dup-test");
        let second = WorkerMetrics::new("dup-test");
        first.entries_acked.inc();
        second.entries_acked.inc();
        assert_eq!(first.entries_acked.get(), 1);
    }
}
