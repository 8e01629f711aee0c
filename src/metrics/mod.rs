//! Prometheus metrics for the webhook delivery service.
//!
//! - Event metrics (triggered events, fan-out size and failures)
//! - Delivery metrics (attempts by result, latency, dead letters, manual retries)
//! - Scheduler metrics (submissions, submit failures, pending jobs)
//! - Backend health (Redis connection, circuit breaker)

mod helpers;

pub use helpers::{encode_metrics, BackendMetrics, DeliveryMetrics, EventMetrics, SchedulerMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Histogram, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "webhook";

lazy_static! {
    // ============================================================================
    // Event Metrics
    // ============================================================================

    /// Events accepted by the dispatcher, by event type
    pub static ref EVENTS_TRIGGERED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_triggered_total", METRIC_PREFIX),
        "Total events triggered",
        &["event_type"]
    ).unwrap();

    /// Endpoints matched per event
    pub static ref EVENT_FANOUT: Histogram = register_histogram!(
        format!("{}_event_fanout", METRIC_PREFIX),
        "Number of endpoints an event was fanned out to",
        vec![0.0, 1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]
    ).unwrap();

    /// Per-endpoint fan-out failures (record creation or job submission)
    pub static ref FANOUT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_fanout_failures_total", METRIC_PREFIX),
        "Total per-endpoint fan-out failures"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Delivery records created
    pub static ref DELIVERIES_CREATED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_deliveries_created_total", METRIC_PREFIX),
        "Total delivery records created"
    ).unwrap();

    /// Delivery attempts by result (success, failure, skipped)
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_delivery_attempts_total", METRIC_PREFIX),
        "Total delivery attempts",
        &["result"]
    ).unwrap();

    /// Outbound request latency by result
    pub static ref DELIVERY_LATENCY: HistogramVec = register_histogram_vec!(
        format!("{}_delivery_latency_seconds", METRIC_PREFIX),
        "Outbound webhook request latency in seconds",
        &["result"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// Deliveries moved to the dead-letter store
    pub static ref DEAD_LETTERS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_dead_letters_total", METRIC_PREFIX),
        "Total deliveries dead-lettered"
    ).unwrap();

    /// Manual retries by origin (delivery, dead_letter)
    pub static ref MANUAL_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_manual_retries_total", METRIC_PREFIX),
        "Total manual retries",
        &["origin"]
    ).unwrap();

    // ============================================================================
    // Scheduler Metrics
    // ============================================================================

    /// Jobs submitted to the scheduler
    pub static ref SCHEDULER_SUBMITTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_scheduler_submitted_total", METRIC_PREFIX),
        "Total jobs submitted to the scheduler"
    ).unwrap();

    /// Job submissions that failed
    pub static ref SCHEDULER_SUBMIT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_scheduler_submit_failures_total", METRIC_PREFIX),
        "Total failed job submissions"
    ).unwrap();

    /// Jobs handed to workers
    pub static ref SCHEDULER_CLAIMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_scheduler_claimed_total", METRIC_PREFIX),
        "Total jobs claimed by workers"
    ).unwrap();

    /// Jobs waiting for their due time
    pub static ref SCHEDULER_PENDING: IntGauge = register_int_gauge!(
        format!("{}_scheduler_pending", METRIC_PREFIX),
        "Jobs currently scheduled and not yet claimed"
    ).unwrap();

    /// Attempts currently in flight
    pub static ref WORKERS_BUSY: IntGauge = register_int_gauge!(
        format!("{}_workers_busy", METRIC_PREFIX),
        "Delivery attempts currently in flight"
    ).unwrap();

    // ============================================================================
    // Backend Metrics
    // ============================================================================

    /// Redis connection status (1 = connected, 0 = disconnected)
    pub static ref REDIS_CONNECTION_STATUS: IntGauge = register_int_gauge!(
        format!("{}_redis_connection_status", METRIC_PREFIX),
        "Redis connection status (1=connected, 0=disconnected)"
    ).unwrap();

    /// Circuit breaker state per backend (0=closed, 1=open, 2=half-open)
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_circuit_breaker_state", METRIC_PREFIX),
        "Backend circuit breaker state (0=closed, 1=open, 2=half-open)",
        &["backend"]
    ).unwrap();

    /// Backend errors by backend and operation
    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_backend_errors_total", METRIC_PREFIX),
        "Total backend errors",
        &["backend", "operation"]
    ).unwrap();
}
