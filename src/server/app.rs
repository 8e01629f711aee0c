use axum::{middleware, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};

use crate::api::{api_routes, public_routes};

use super::{api_key_auth, AppState};

/// Largest accepted request body (event payloads included)
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let protected = api_routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        api_key_auth,
    ));

    Router::new()
        .merge(public_routes())
        .nest("/api/v1", protected)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
