//! Delivery lookup and the manual recovery endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::delivery::{DeadLetterEntry, DeadLetterFilter, Delivery, StoreError};
use crate::error::Result;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct DeadLetterListResponse {
    pub dead_letters: Vec<DeadLetterEntry>,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    pub dead_letter_id: Uuid,
    pub delivery: Delivery,
}

/// GET /api/v1/deliveries/{id}
#[tracing::instrument(name = "http.get_delivery", skip(state))]
pub async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Delivery>> {
    let delivery = state
        .stores
        .deliveries
        .get(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("delivery {id}")))?;
    Ok(Json(delivery))
}

/// POST /api/v1/deliveries/{id}/retry
#[tracing::instrument(name = "http.retry_delivery", skip(state))]
pub async fn retry_delivery(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Delivery>> {
    Ok(Json(state.recovery.retry_delivery(id).await?))
}

/// GET /api/v1/dead-letters
#[tracing::instrument(name = "http.list_dead_letters", skip(state, filter))]
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(filter): Query<DeadLetterFilter>,
) -> Result<Json<DeadLetterListResponse>> {
    let dead_letters = state.stores.dead_letters.list(&filter).await?;
    Ok(Json(DeadLetterListResponse {
        count: dead_letters.len(),
        dead_letters,
        limit: filter.limit,
        offset: filter.offset,
    }))
}

/// GET /api/v1/dead-letters/{id}
#[tracing::instrument(name = "http.get_dead_letter", skip(state))]
pub async fn get_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeadLetterEntry>> {
    let entry = state
        .stores
        .dead_letters
        .get(id)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("dead letter {id}")))?;
    Ok(Json(entry))
}

/// POST /api/v1/dead-letters/{id}/retry
#[tracing::instrument(name = "http.retry_dead_letter", skip(state))]
pub async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayResponse>> {
    let delivery = state.recovery.retry_from_dead_letter(id).await?;
    Ok(Json(ReplayResponse {
        dead_letter_id: id,
        delivery,
    }))
}
