use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::error::AppError;

/// Header carrying the admin API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Validates `X-API-Key` against `api.key`. Open when no key is configured.
pub async fn api_key_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_key) = &state.settings.api.key else {
        return next.run(req).await;
    };

    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match api_key {
        Some(key) if key == expected_key => next.run(req).await,
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "Invalid API key provided");
            AppError::Auth("Invalid API key".to_string()).into_response()
        }
        None => {
            tracing::warn!(path = %req.uri().path(), "Missing API key header");
            AppError::Auth("Missing X-API-Key header".to_string()).into_response()
        }
    }
}
