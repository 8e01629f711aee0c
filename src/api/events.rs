use axum::{extract::State, http::StatusCode, Json};

use crate::dispatcher::{DomainEvent, TriggerResult};
use crate::error::{AppError, Result};
use crate::server::AppState;

/// POST /api/v1/events
///
/// Published on the event bus. Deliveries run asynchronously; the response
/// only reports the webhook fan-out.
#[tracing::instrument(
    name = "http.trigger_event",
    skip(state, event),
    fields(event_type = %event.event_type)
)]
pub async fn trigger_event(
    State(state): State<AppState>,
    Json(event): Json<DomainEvent>,
) -> Result<(StatusCode, Json<TriggerResult>)> {
    let report = state.event_bus.publish(&event).await;
    if report.is_unrouted() {
        return Err(AppError::Validation(format!(
            "Unknown event type: {}",
            event.event_type
        )));
    }
    if let Some(err) = report.errors.into_iter().next() {
        return Err(err.into());
    }

    let result = report.fan_outs.into_iter().next().ok_or_else(|| {
        AppError::Internal(format!("No webhook dispatcher for {}", event.event_type))
    })?;
    Ok((StatusCode::ACCEPTED, Json(result)))
}
