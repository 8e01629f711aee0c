//! Endpoint management, per-endpoint delivery history and stats.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delivery::{Delivery, DeliveryFilter, DeliveryStats};
use crate::error::Result;
use crate::registry::{Endpoint, EndpointUpdate, NewEndpoint, RegistryError, KNOWN_EVENT_TYPES};
use crate::server::AppState;

/// Returned only by create and rotate: the one time the secret is shown.
#[derive(Debug, Serialize)]
pub struct EndpointWithSecret {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub secret: String,
}

impl From<Endpoint> for EndpointWithSecret {
    fn from(endpoint: Endpoint) -> Self {
        let secret = endpoint.secret.clone();
        Self { endpoint, secret }
    }
}

#[derive(Debug, Serialize)]
pub struct EndpointListResponse {
    pub webhooks: Vec<Endpoint>,
    pub total: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListEndpointsQuery {
    pub owner_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteEndpointResponse {
    pub id: Uuid,
    pub deleted: bool,
    pub deactivated: bool,
}

#[derive(Debug, Serialize)]
pub struct DeliveryListResponse {
    pub deliveries: Vec<Delivery>,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct EndpointStatsResponse {
    pub endpoint_id: Uuid,
    pub stats: DeliveryStats,
}

#[derive(Debug, Serialize)]
pub struct EventTypeInfo {
    pub name: &'static str,
    pub description: &'static str,
}

async fn require_endpoint(state: &AppState, id: Uuid) -> Result<Endpoint> {
    state
        .endpoints
        .registry
        .get_endpoint(id)
        .await?
        .ok_or_else(|| RegistryError::NotFound(id).into())
}

/// POST /api/v1/webhooks
#[tracing::instrument(
    name = "http.create_webhook",
    skip(state, request),
    fields(url = %request.url)
)]
pub async fn create_webhook(
    State(state): State<AppState>,
    Json(request): Json<NewEndpoint>,
) -> Result<(StatusCode, Json<EndpointWithSecret>)> {
    let endpoint = state.endpoints.admin.create(request).await?;
    tracing::info!(endpoint_id = %endpoint.id, "Webhook endpoint registered");
    Ok((StatusCode::CREATED, Json(endpoint.into())))
}

/// GET /api/v1/webhooks
#[tracing::instrument(name = "http.list_webhooks", skip(state))]
pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListEndpointsQuery>,
) -> Result<Json<EndpointListResponse>> {
    let webhooks = state
        .endpoints
        .admin
        .list(query.owner_id.as_deref())
        .await?;
    let total = webhooks.len();
    Ok(Json(EndpointListResponse { webhooks, total }))
}

/// GET /api/v1/webhooks/{id}
#[tracing::instrument(name = "http.get_webhook", skip(state))]
pub async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Endpoint>> {
    Ok(Json(require_endpoint(&state, id).await?))
}

/// PATCH /api/v1/webhooks/{id}
#[tracing::instrument(name = "http.update_webhook", skip(state, update))]
pub async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<EndpointUpdate>,
) -> Result<Json<Endpoint>> {
    Ok(Json(state.endpoints.admin.update(id, update).await?))
}

/// DELETE /api/v1/webhooks/{id}
///
/// Endpoints with delivery history are deactivated instead of removed.
#[tracing::instrument(name = "http.delete_webhook", skip(state))]
pub async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeleteEndpointResponse>> {
    require_endpoint(&state, id).await?;

    let history = state.stores.deliveries.count_for_endpoint(id).await?;
    if history > 0 {
        state.endpoints.admin.deactivate(id).await?;
        tracing::info!(endpoint_id = %id, deliveries = history, "Webhook endpoint deactivated");
        return Ok(Json(DeleteEndpointResponse {
            id,
            deleted: false,
            deactivated: true,
        }));
    }

    state.endpoints.admin.delete(id).await?;
    tracing::info!(endpoint_id = %id, "Webhook endpoint deleted");
    Ok(Json(DeleteEndpointResponse {
        id,
        deleted: true,
        deactivated: false,
    }))
}

/// POST /api/v1/webhooks/{id}/rotate-secret
#[tracing::instrument(name = "http.rotate_secret", skip(state))]
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndpointWithSecret>> {
    let endpoint = state.endpoints.admin.rotate_secret(id).await?;
    tracing::info!(endpoint_id = %id, "Webhook secret rotated");
    Ok(Json(endpoint.into()))
}

/// GET /api/v1/webhooks/{id}/deliveries
#[tracing::instrument(name = "http.list_endpoint_deliveries", skip(state, filter))]
pub async fn list_endpoint_deliveries(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(filter): Query<DeliveryFilter>,
) -> Result<Json<DeliveryListResponse>> {
    require_endpoint(&state, id).await?;

    let filter = DeliveryFilter {
        endpoint_id: Some(id),
        ..filter
    };
    let deliveries = state.stores.deliveries.list(&filter).await?;
    Ok(Json(DeliveryListResponse {
        count: deliveries.len(),
        deliveries,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

/// GET /api/v1/webhooks/{id}/stats
#[tracing::instrument(name = "http.endpoint_stats", skip(state))]
pub async fn endpoint_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EndpointStatsResponse>> {
    require_endpoint(&state, id).await?;
    let stats = state.stores.deliveries.stats(Some(id)).await?;
    Ok(Json(EndpointStatsResponse {
        endpoint_id: id,
        stats,
    }))
}

/// GET /api/v1/webhook-event-types
pub async fn list_event_types() -> Json<Vec<EventTypeInfo>> {
    Json(
        KNOWN_EVENT_TYPES
            .iter()
            .map(|&(name, description)| EventTypeInfo { name, description })
            .collect(),
    )
}
