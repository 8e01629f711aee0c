//! Delivery records, dead letters and the event log.
//!
//! Every write that moves a delivery forward is fenced on the delivery's
//! current `job_id`: a worker holding a superseded job cannot overwrite the
//! result of a newer one.

mod dead_letter;
mod memory;
mod models;
mod postgres;
pub mod retry_policy;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::infrastructure::postgres::{PostgresPool, PostgresPoolError};

pub use memory::{MemoryDeadLetterStore, MemoryDeliveryStore, MemoryEventLogStore};
pub use models::{
    AttemptRecord, ClaimResult, DeadLetterEntry, DeadLetterFilter, Delivery, DeliveryFilter,
    DeliveryStats, DeliveryStatus, EventLogEntry, ResetResult, MAX_PAGE_SIZE,
};
pub use postgres::{PostgresDeadLetterStore, PostgresDeliveryStore, PostgresEventLogStore};
pub use retry_policy::{delay_before_attempt, MAX_ATTEMPTS};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Serialization(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<PostgresPoolError> for StoreError {
    fn from(err: PostgresPoolError) -> Self {
        match err {
            PostgresPoolError::Sqlx(e) => StoreError::Postgres(e),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError>;

    /// Remove a delivery that never got a job. No-op when missing.
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>, StoreError>;

    /// Counts by status, for one endpoint or all.
    async fn stats(&self, endpoint_id: Option<Uuid>) -> Result<DeliveryStats, StoreError>;

    async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<u64, StoreError>;

    /// Atomically take the lease on a delivery for `job_id`.
    ///
    /// Succeeds only when the delivery is pending or retrying, `job_id` is
    /// its current job, and no unexpired lease exists at `now`.
    async fn claim(
        &self,
        id: Uuid,
        job_id: Uuid,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError>;

    /// `delivered` with the attempt's status and response. Returns false
    /// when fenced out.
    async fn mark_delivered(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// `retrying`, handing the delivery to `next_job_id`.
    async fn schedule_retry(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        next_retry_at: DateTime<Utc>,
        next_job_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// `failed`. Returns the final record, or `None` when fenced out.
    async fn mark_failed(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError>;

    /// Back to `pending` with zero attempts and a new job. Refused while a
    /// lease is unexpired at `now`.
    async fn reset_for_retry(
        &self,
        id: Uuid,
        next_job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ResetResult, StoreError>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Insert unless an entry for the same job exists. Returns the stored
    /// entry either way.
    async fn insert(&self, entry: &DeadLetterEntry) -> Result<DeadLetterEntry, StoreError>;

    async fn remove(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Newest first.
    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError>;

    async fn count(&self, replayed: Option<bool>) -> Result<u64, StoreError>;

    /// Set `retried_at` once. Returns false if it was already set.
    async fn mark_retried(
        &self,
        id: Uuid,
        retry_delivery_id: Uuid,
        retried_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait EventLogStore: Send + Sync {
    async fn record(&self, entry: &EventLogEntry) -> Result<(), StoreError>;

    /// Mark fan-out complete with the number of endpoints scheduled.
    async fn complete(
        &self,
        id: Uuid,
        endpoint_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<EventLogEntry>, StoreError>;
}

#[derive(Clone)]
pub struct Stores {
    pub deliveries: Arc<dyn DeliveryStore>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub events: Arc<dyn EventLogStore>,
    backend: &'static str,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            deliveries: Arc::new(MemoryDeliveryStore::new()),
            dead_letters: Arc::new(MemoryDeadLetterStore::new()),
            events: Arc::new(MemoryEventLogStore::new()),
            backend: "memory",
        }
    }

    pub fn postgres(pool: Arc<PostgresPool>) -> Self {
        Self {
            deliveries: Arc::new(PostgresDeliveryStore::new(pool.clone())),
            dead_letters: Arc::new(PostgresDeadLetterStore::new(pool.clone())),
            events: Arc::new(PostgresEventLogStore::new(pool)),
            backend: "postgres",
        }
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend
    }
}

/// Create the delivery, dead-letter and event log stores.
///
/// `"postgres"` needs a pool; without one this falls back to memory.
pub fn create_stores(settings: &StoreConfig, postgres_pool: Option<Arc<PostgresPool>>) -> Stores {
    match settings.backend.as_str() {
        "postgres" => {
            if let Some(pool) = postgres_pool {
                tracing::info!(backend = "postgres", "Creating PostgreSQL delivery stores");
                Stores::postgres(pool)
            } else {
                tracing::warn!(
                    "PostgreSQL store requested but no pool provided, falling back to memory"
                );
                Stores::memory()
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory delivery stores");
            Stores::memory()
        }
    }
}
