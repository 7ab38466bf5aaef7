//! Prometheus metrics for monitoring the passthrough relay.

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of HTTP requests by method, endpoint and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Forwarding attempts by channel and outcome
    pub relay_attempts: IntCounterVec,

    /// Attempts beyond the first one
    pub relay_retries: IntCounter,

    /// Time to first upstream byte for streaming relays, in seconds
    pub stream_first_byte: HistogramVec,

    /// Streams currently being piped to callers
    pub active_streams: IntGauge,

    /// Quota charged per model
    pub quota_consumed: IntCounterVec,

    /// Settlements by where the token counts came from
    pub billing_source: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Subsequent calls return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "relay_requests_total",
            "Total number of requests",
            &["method", "endpoint", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "relay_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )
        .expect("Failed to register request_duration metric");

        let relay_attempts = register_int_counter_vec!(
            "relay_attempts_total",
            "Upstream forwarding attempts",
            &["channel", "outcome"]
        )
        .expect("Failed to register relay_attempts metric");

        let relay_retries = register_int_counter!(
            "relay_retries_total",
            "Forwarding attempts beyond the first"
        )
        .expect("Failed to register relay_retries metric");

        let stream_first_byte = register_histogram_vec!(
            "relay_stream_first_byte_seconds",
            "Time to first upstream byte for streaming relays",
            &["channel"],
            vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register stream_first_byte metric");

        let active_streams = register_int_gauge!(
            "relay_active_streams",
            "Streams currently being relayed"
        )
        .expect("Failed to register active_streams metric");

        let quota_consumed = register_int_counter_vec!(
            "relay_quota_consumed_total",
            "Quota charged after reconciliation",
            &["model"]
        )
        .expect("Failed to register quota_consumed metric");

        let billing_source = register_int_counter_vec!(
            "relay_billing_source_total",
            "Settlements by token count source",
            &["source"]
        )
        .expect("Failed to register billing_source metric");

        Metrics {
            request_count,
            request_duration,
            relay_attempts,
            relay_retries,
            stream_first_byte,
            active_streams,
            quota_consumed,
            billing_source,
        }
    })
}

/// Get the global metrics instance, registering it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<(String, Vec<u8>), prometheus::Error> {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let metrics = init_metrics();
        let metrics2 = get_metrics();
        assert!(std::ptr::eq(metrics, metrics2));
    }

    #[test]
    fn test_relay_attempts_metric() {
        let metrics = init_metrics();
        let labels = ["metrics-test-channel", "success"];
        let initial = metrics.relay_attempts.with_label_values(&labels).get();
        metrics.relay_attempts.with_label_values(&labels).inc();
        assert_eq!(metrics.relay_attempts.with_label_values(&labels).get(), initial + 1);
    }

    #[test]
    fn test_quota_consumed_metric() {
        let metrics = init_metrics();
        let initial = metrics
            .quota_consumed
            .with_label_values(&["metrics-test-model"])
            .get();
        metrics
            .quota_consumed
            .with_label_values(&["metrics-test-model"])
            .inc_by(250);
        assert_eq!(
            metrics
                .quota_consumed
                .with_label_values(&["metrics-test-model"])
                .get(),
            initial + 250
        );
    }

    #[test]
    fn test_gather_text_contains_registered_metrics() {
        init_metrics()
            .billing_source
            .with_label_values(&["upstream"])
            .inc();
        let (content_type, body) = gather_text().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("relay_billing_source_total"));
    }
}
