//! PostgreSQL endpoint registry.
//!
//! Table: `webhook_endpoints` (see `migrations/`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::infrastructure::postgres::PostgresPool;
use crate::signature::{generate_secret, DEFAULT_SECRET_BYTES};

use super::models::dedup;
use super::{Endpoint, EndpointAdmin, EndpointRegistry, EndpointUpdate, NewEndpoint, RegistryError};

const ENDPOINT_COLUMNS: &str =
    "id, url, secret, events, is_active, owner_id, metadata, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct EndpointRow {
    id: Uuid,
    url: String,
    secret: String,
    events: Vec<String>,
    is_active: bool,
    owner_id: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<EndpointRow> for Endpoint {
    fn from(row: EndpointRow) -> Self {
        Self {
            id: row.id,
            url: row.url,
            secret: row.secret,
            events: row.events,
            is_active: row.is_active,
            owner_id: row.owner_id,
            metadata: row.metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub struct PostgresEndpointRegistry {
    pool: Arc<PostgresPool>,
}

impl PostgresEndpointRegistry {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<Endpoint>, RegistryError> {
        let query = format!("SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1");
        let row: Option<EndpointRow> = self
            .pool
            .execute("registry_get", |pool| async move {
                sqlx::query_as(&query).bind(id).fetch_optional(&pool).await
            })
            .await?;
        Ok(row.map(Endpoint::from))
    }

    async fn save(&self, endpoint: &Endpoint) -> Result<(), RegistryError> {
        self.pool
            .execute("registry_save", |pool| async move {
                sqlx::query(
                    r#"
                    UPDATE webhook_endpoints
                    SET url = $2, secret = $3, events = $4, is_active = $5,
                        metadata = $6, updated_at = $7
                    WHERE id = $1
                    "#,
                )
                .bind(endpoint.id)
                .bind(&endpoint.url)
                .bind(&endpoint.secret)
                .bind(&endpoint.events)
                .bind(endpoint.is_active)
                .bind(&endpoint.metadata)
                .bind(endpoint.updated_at)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EndpointRegistry for PostgresEndpointRegistry {
    async fn find_active_endpoints_subscribed_to(
        &self,
        event_type: &str,
    ) -> Result<Vec<Endpoint>, RegistryError> {
        let query = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints \
             WHERE is_active AND $1 = ANY(events) ORDER BY created_at"
        );
        let rows: Vec<EndpointRow> = self
            .pool
            .execute("registry_find_subscribers", |pool| async move {
                sqlx::query_as(&query).bind(event_type).fetch_all(&pool).await
            })
            .await?;
        Ok(rows.into_iter().map(Endpoint::from).collect())
    }

    async fn get_endpoint(&self, id: Uuid) -> Result<Option<Endpoint>, RegistryError> {
        self.fetch(id).await
    }

    fn backend_type(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl EndpointAdmin for PostgresEndpointRegistry {
    async fn create(&self, new: NewEndpoint) -> Result<Endpoint, RegistryError> {
        new.validate()?;

        let now = Utc::now();
        let endpoint = Endpoint {
            id: Uuid::new_v4(),
            url: new.url,
            secret: generate_secret(DEFAULT_SECRET_BYTES),
            events: dedup(new.events),
            is_active: true,
            owner_id: new.owner_id,
            metadata: new.metadata.unwrap_or(Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
        };

        let ep = &endpoint;
        self.pool
            .execute("registry_create", |pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO webhook_endpoints
                        (id, url, secret, events, is_active, owner_id, metadata,
                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    "#,
                )
                .bind(ep.id)
                .bind(&ep.url)
                .bind(&ep.secret)
                .bind(&ep.events)
                .bind(ep.is_active)
                .bind(&ep.owner_id)
                .bind(&ep.metadata)
                .bind(ep.created_at)
                .bind(ep.updated_at)
                .execute(&pool)
                .await
            })
            .await?;

        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url, "Endpoint registered");
        Ok(endpoint)
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<Endpoint>, RegistryError> {
        let query = format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints \
             WHERE ($1::TEXT IS NULL OR owner_id = $1) ORDER BY created_at"
        );
        let rows: Vec<EndpointRow> = self
            .pool
            .execute("registry_list", |pool| async move {
                sqlx::query_as(&query).bind(owner_id).fetch_all(&pool).await
            })
            .await?;
        Ok(rows.into_iter().map(Endpoint::from).collect())
    }

    async fn update(&self, id: Uuid, update: EndpointUpdate) -> Result<Endpoint, RegistryError> {
        update.validate()?;

        let mut endpoint = self.fetch(id).await?.ok_or(RegistryError::NotFound(id))?;
        update.apply(&mut endpoint);
        self.save(&endpoint).await?;
        Ok(endpoint)
    }

    async fn deactivate(&self, id: Uuid) -> Result<Endpoint, RegistryError> {
        self.update(
            id,
            EndpointUpdate {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RegistryError> {
        let result = self
            .pool
            .execute("registry_delete", |pool| async move {
                sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    async fn rotate_secret(&self, id: Uuid) -> Result<Endpoint, RegistryError> {
        let mut endpoint = self.fetch(id).await?.ok_or(RegistryError::NotFound(id))?;
        endpoint.secret = generate_secret(DEFAULT_SECRET_BYTES);
        endpoint.updated_at = Utc::now();
        self.save(&endpoint).await?;

        tracing::info!(endpoint_id = %id, "Endpoint secret rotated");
        Ok(endpoint)
    }
}
