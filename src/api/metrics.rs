//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse};

use crate::metrics::{self, BackendMetrics, SchedulerMetrics};
use crate::server::AppState;

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    refresh_gauges(&state).await;

    match metrics::encode_metrics() {
        Ok(output) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            output,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode Prometheus metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain")],
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Gauges that are cheaper to sample on scrape than to track on every change
async fn refresh_gauges(state: &AppState) {
    if let Ok(pending) = state.scheduler.pending().await {
        SchedulerMetrics::set_pending(pending);
    }
    if let Some(pool) = &state.redis_pool {
        BackendMetrics::set_redis_connected(pool.is_healthy());
        BackendMetrics::set_circuit_state("redis", pool.circuit_state() as u8);
    }
}
