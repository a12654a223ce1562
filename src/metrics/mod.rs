//! Prometheus metrics for the dispatch pipeline.
//!
//! - Submission metrics (messages added by priority)
//! - Dispatch metrics (outcome per message, duration)
//! - Sink and publisher failure metrics
//! - Store read metrics (empty polls, errors)

mod helpers;

pub use helpers::{encode_metrics, DispatchMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "notify";

lazy_static! {
    /// Messages accepted by `add`, by priority
    pub static ref MESSAGES_ADDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_added_total", METRIC_PREFIX),
        "Total messages accepted for dispatch",
        &["priority"]
    ).unwrap();

    /// Messages that completed a dispatch attempt, by outcome
    pub static ref MESSAGES_DISPATCHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_dispatched_total", METRIC_PREFIX),
        "Total dispatch attempts by outcome",
        &["outcome"]
    ).unwrap();

    /// Sink failures, by sink
    pub static ref SINK_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_sink_failures_total", METRIC_PREFIX),
        "Total sink failures",
        &["sink"]
    ).unwrap();

    /// Publish attempts, by publisher and outcome
    pub static ref PUBLISH_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_publish_total", METRIC_PREFIX),
        "Total publish attempts",
        &["publisher", "outcome"]
    ).unwrap();

    /// Failed store reads
    pub static ref STORE_ERRORS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_store_errors_total", METRIC_PREFIX),
        "Total failed store reads"
    ).unwrap();

    /// Store reads that returned nothing
    pub static ref EMPTY_POLLS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_empty_polls_total", METRIC_PREFIX),
        "Total store reads that returned no message"
    ).unwrap();

    /// Time from fetch to delete for one message
    pub static ref DISPATCH_DURATION: Histogram = register_histogram!(
        format!("{}_dispatch_duration_seconds", METRIC_PREFIX),
        "Time spent dispatching a single message",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();
}
