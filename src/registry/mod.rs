//! Endpoint registry: subscriber endpoints, their secrets and subscriptions.
//!
//! The delivery pipeline only reads through [`EndpointRegistry`]. Management
//! operations used by the admin API live on [`EndpointAdmin`].

mod memory;
mod models;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::infrastructure::postgres::{PostgresPool, PostgresPoolError};

pub use memory::MemoryEndpointRegistry;
pub use models::{
    is_known_event_type, validate_url, Endpoint, EndpointUpdate, NewEndpoint, KNOWN_EVENT_TYPES,
};
pub use postgres::PostgresEndpointRegistry;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Endpoint not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid endpoint: {0}")]
    Validation(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),
}

impl From<PostgresPoolError> for RegistryError {
    fn from(err: PostgresPoolError) -> Self {
        match err {
            PostgresPoolError::Sqlx(e) => RegistryError::Postgres(e),
            other => RegistryError::Unavailable(other.to_string()),
        }
    }
}

/// Read access used by the dispatcher and recovery paths.
#[async_trait]
pub trait EndpointRegistry: Send + Sync {
    /// Active endpoints whose subscription set contains `event_type`.
    async fn find_active_endpoints_subscribed_to(
        &self,
        event_type: &str,
    ) -> Result<Vec<Endpoint>, RegistryError>;

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, RegistryError>;

    fn backend_type(&self) -> &'static str;
}

/// Endpoint management.
#[async_trait]
pub trait EndpointAdmin: Send + Sync {
    /// Register an endpoint with a freshly generated secret.
    async fn create(&self, new: NewEndpoint) -> Result<Endpoint, RegistryError>;

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Endpoint>, RegistryError>;

    async fn update(&self, id: Uuid, update: EndpointUpdate) -> Result<Endpoint, RegistryError>;

    /// Stop new fan-out to the endpoint; history is kept.
    async fn deactivate(&self, id: Uuid) -> Result<Endpoint, RegistryError>;

    /// Remove the endpoint entirely.
    async fn delete(&self, id: Uuid) -> Result<(), RegistryError>;

    /// Replace the secret, returning the endpoint with the new one.
    async fn rotate_secret(&self, id: Uuid) -> Result<Endpoint, RegistryError>;
}

/// Both views of one registry backend.
#[derive(Clone)]
pub struct Endpoints {
    pub registry: Arc<dyn EndpointRegistry>,
    pub admin: Arc<dyn EndpointAdmin>,
}

impl Endpoints {
    pub fn memory() -> Self {
        let backend = Arc::new(MemoryEndpointRegistry::new());
        Self {
            registry: backend.clone(),
            admin: backend,
        }
    }
}

/// Create the endpoint registry based on configuration.
///
/// `"postgres"` needs a pool; without one this falls back to memory.
pub fn create_endpoint_registry(
    settings: &RegistryConfig,
    postgres_pool: Option<Arc<PostgresPool>>,
) -> Endpoints {
    match settings.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(backend = "postgres", "Creating PostgreSQL endpoint registry");
                let backend = Arc::new(PostgresEndpointRegistry::new(pool));
                Endpoints {
                    registry: backend.clone(),
                    admin: backend,
                }
            } else {
                tracing::warn!(
                    "PostgreSQL registry requested but no pool provided, falling back to memory"
                );
                Endpoints::memory()
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory endpoint registry");
            Endpoints::memory()
        }
    }
}
