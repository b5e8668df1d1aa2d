//! Prometheus Metrics Module
//!
//! Process-wide metrics for the realtime core.
//!
//! # Metrics Collected
//! - Session state gauge (one series per state, exactly one set to 1)
//! - Reconnect attempts
//! - Frames sent and received by op
//! - Inbound frames dropped, by reason
//! - Failed outbound actions, by error kind
//! - Outbound action latency histograms

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "chat_realtime";

const SESSION_STATES: [&str; 4] = ["disconnected", "connecting", "connected", "disconnecting"];

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

/// Current session state
pub static SESSION_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    GaugeVec::new(
        Opts::new("session_state", "Current realtime session state").namespace(NAMESPACE),
        &["state"],
    )
    .expect("Failed to create SESSION_STATE metric")
});

/// Reconnect attempts scheduled after a lost connection
pub static RECONNECT_ATTEMPTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(
        Opts::new("reconnect_attempts_total", "Total reconnect attempts scheduled")
            .namespace(NAMESPACE),
    )
    .expect("Failed to create RECONNECT_ATTEMPTS_TOTAL metric")
});

/// Frames by direction and op
pub static FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("frames_total", "Total frames written or read").namespace(NAMESPACE),
        &["direction", "op"], // direction: "inbound", "outbound"
    )
    .expect("Failed to create FRAMES_TOTAL metric")
});

/// Inbound frames discarded without dispatch
pub static FRAMES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("frames_dropped_total", "Inbound frames dropped").namespace(NAMESPACE),
        &["reason"], // "decode", "no_handler"
    )
    .expect("Failed to create FRAMES_DROPPED_TOTAL metric")
});

/// Outbound actions that failed
pub static SEND_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("send_failures_total", "Outbound actions that failed").namespace(NAMESPACE),
        &["destination", "kind"],
    )
    .expect("Failed to create SEND_FAILURES_TOTAL metric")
});

/// Outbound action latency, from submission to acknowledgement
pub static SEND_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
    HistogramVec::new(
        HistogramOpts::new(
            "send_duration_seconds",
            "Outbound action latency in seconds",
        )
        .namespace(NAMESPACE)
        .buckets(buckets),
        &["destination"],
    )
    .expect("Failed to create SEND_DURATION_SECONDS metric")
});

/// Register all metrics with the registry
fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(SESSION_STATE.clone()))
        .expect("Failed to register SESSION_STATE");
    registry
        .register(Box::new(RECONNECT_ATTEMPTS_TOTAL.clone()))
        .expect("Failed to register RECONNECT_ATTEMPTS_TOTAL");
    registry
        .register(Box::new(FRAMES_TOTAL.clone()))
        .expect("Failed to register FRAMES_TOTAL");
    registry
        .register(Box::new(FRAMES_DROPPED_TOTAL.clone()))
        .expect("Failed to register FRAMES_DROPPED_TOTAL");
    registry
        .register(Box::new(SEND_FAILURES_TOTAL.clone()))
        .expect("Failed to register SEND_FAILURES_TOTAL");
    registry
        .register(Box::new(SEND_DURATION_SECONDS.clone()))
        .expect("Failed to register SEND_DURATION_SECONDS");
}

/// Collect and encode all metrics as Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Helper to publish the current session state
pub fn set_session_state(state: &str) {
    for candidate in SESSION_STATES {
        SESSION_STATE
            .with_label_values(&[candidate])
            .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

/// Helper to count a scheduled reconnect
pub fn record_reconnect_attempt() {
    RECONNECT_ATTEMPTS_TOTAL.inc();
}

/// Helper to count a frame crossing the transport
pub fn record_frame(direction: &str, op: &str) {
    FRAMES_TOTAL.with_label_values(&[direction, op]).inc();
}

/// Helper to count a dropped inbound frame
pub fn record_dropped_frame(reason: &str) {
    FRAMES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

/// Helper to record the outcome of an outbound action
pub fn record_send(destination: &str, outcome: Result<(), &str>, duration_secs: f64) {
    match outcome {
        Ok(()) => SEND_DURATION_SECONDS
            .with_label_values(&[destination])
            .observe(duration_secs),
        Err(kind) => SEND_FAILURES_TOTAL
            .with_label_values(&[destination, kind])
            .inc(),
    }
}
