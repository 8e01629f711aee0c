use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::deliveries::{
    get_dead_letter, get_delivery, list_dead_letters, retry_dead_letter, retry_delivery,
};
use super::events::trigger_event;
use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::webhooks::{
    create_webhook, delete_webhook, endpoint_stats, get_webhook, list_endpoint_deliveries,
    list_event_types, list_webhooks, rotate_secret, update_webhook,
};

/// Unauthenticated operational routes.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
}

/// Admin routes, mounted under `/api/v1` behind the API key check.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Endpoints
        .route("/webhooks", post(create_webhook).get(list_webhooks))
        .route(
            "/webhooks/{id}",
            get(get_webhook).patch(update_webhook).delete(delete_webhook),
        )
        .route("/webhooks/{id}/rotate-secret", post(rotate_secret))
        .route("/webhooks/{id}/deliveries", get(list_endpoint_deliveries))
        .route("/webhooks/{id}/stats", get(endpoint_stats))
        .route("/webhook-event-types", get(list_event_types))
        // Events
        .route("/events", post(trigger_event))
        // Deliveries and recovery
        .route("/deliveries/{id}", get(get_delivery))
        .route("/deliveries/{id}/retry", post(retry_delivery))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}", get(get_dead_letter))
        .route("/dead-letters/{id}/retry", post(retry_dead_letter))
}
