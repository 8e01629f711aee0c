//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKEND_ERRORS_TOTAL, CIRCUIT_BREAKER_STATE, DEAD_LETTERS_TOTAL, DELIVERIES_CREATED_TOTAL,
    DELIVERY_ATTEMPTS_TOTAL, DELIVERY_LATENCY, EVENTS_TRIGGERED_TOTAL, EVENT_FANOUT,
    FANOUT_FAILURES_TOTAL, MANUAL_RETRIES_TOTAL, REDIS_CONNECTION_STATUS, SCHEDULER_CLAIMED_TOTAL,
    SCHEDULER_PENDING, SCHEDULER_SUBMITTED_TOTAL, SCHEDULER_SUBMIT_FAILURES_TOTAL, WORKERS_BUSY,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording event fan-out metrics
pub struct EventMetrics;

impl EventMetrics {
    /// Record a triggered event and how many endpoints it fanned out to
    pub fn record_triggered(event_type: &str, fanout: usize) {
        EVENTS_TRIGGERED_TOTAL.with_label_values(&[event_type]).inc();
        EVENT_FANOUT.observe(fanout as f64);
    }

    /// Record a failure isolated to one endpoint during fan-out
    pub fn record_fanout_failure() {
        FANOUT_FAILURES_TOTAL.inc();
    }
}

/// Helper struct for recording delivery metrics
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_created() {
        DELIVERIES_CREATED_TOTAL.inc();
    }

    pub fn record_success(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
        DELIVERY_LATENCY
            .with_label_values(&["success"])
            .observe(latency.as_secs_f64());
    }

    pub fn record_failure(latency: Duration) {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["failure"]).inc();
        DELIVERY_LATENCY
            .with_label_values(&["failure"])
            .observe(latency.as_secs_f64());
    }

    /// Job was stale or a duplicate handoff
    pub fn record_skipped() {
        DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["skipped"]).inc();
    }

    pub fn record_dead_lettered() {
        DEAD_LETTERS_TOTAL.inc();
    }

    pub fn record_manual_retry(origin: &str) {
        MANUAL_RETRIES_TOTAL.with_label_values(&[origin]).inc();
    }

    pub fn worker_started() {
        WORKERS_BUSY.inc();
    }

    pub fn worker_finished() {
        WORKERS_BUSY.dec();
    }
}

/// Helper struct for recording scheduler metrics
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn record_submitted() {
        SCHEDULER_SUBMITTED_TOTAL.inc();
    }

    pub fn record_submit_failure() {
        SCHEDULER_SUBMIT_FAILURES_TOTAL.inc();
    }

    pub fn record_claimed(count: usize) {
        SCHEDULER_CLAIMED_TOTAL.inc_by(count as u64);
    }

    pub fn set_pending(count: usize) {
        SCHEDULER_PENDING.set(count as i64);
    }
}

/// Helper struct for backend health metrics
pub struct BackendMetrics;

impl BackendMetrics {
    pub fn set_redis_connected(connected: bool) {
        REDIS_CONNECTION_STATUS.set(if connected { 1 } else { 0 });
    }

    pub fn set_circuit_state(backend: &str, state: u8) {
        CIRCUIT_BREAKER_STATE
            .with_label_values(&[backend])
            .set(state as i64);
    }

    pub fn record_error(backend: &str, operation: &str) {
        BACKEND_ERRORS_TOTAL
            .with_label_values(&[backend, operation])
            .inc();
    }
}
