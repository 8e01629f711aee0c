//! Admin HTTP surface, organized by resource.

mod deliveries;
mod events;
mod health;
mod metrics;
mod routes;
mod webhooks;

pub use deliveries::{DeadLetterListResponse, ReplayResponse};
pub use health::{HealthResponse, StatsResponse};
pub use routes::{api_routes, public_routes};
pub use webhooks::{DeleteEndpointResponse, EndpointWithSecret};
