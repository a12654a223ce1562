//! Metrics helper for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    DISPATCH_DURATION, EMPTY_POLLS_TOTAL, MESSAGES_ADDED_TOTAL, MESSAGES_DISPATCHED_TOTAL,
    PUBLISH_TOTAL, SINK_FAILURES_TOTAL, STORE_ERRORS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording dispatch pipeline metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record a message accepted by `add`
    pub fn record_added(priority: &str) {
        MESSAGES_ADDED_TOTAL.with_label_values(&[priority]).inc();
    }

    /// Record a finished dispatch attempt by outcome ("published", "no_recipients", ...)
    pub fn record_dispatched(outcome: &str, duration_secs: f64) {
        MESSAGES_DISPATCHED_TOTAL.with_label_values(&[outcome]).inc();
        DISPATCH_DURATION.observe(duration_secs);
    }

    pub fn record_sink_failure(sink: &str) {
        SINK_FAILURES_TOTAL.with_label_values(&[sink]).inc();
    }

    pub fn record_published(publisher: &str) {
        PUBLISH_TOTAL.with_label_values(&[publisher, "success"]).inc();
    }

    pub fn record_publish_failed(publisher: &str) {
        PUBLISH_TOTAL.with_label_values(&[publisher, "failure"]).inc();
    }

    pub fn record_store_error() {
        STORE_ERRORS_TOTAL.inc();
    }

    pub fn record_empty_poll() {
        EMPTY_POLLS_TOTAL.inc();
    }
}
