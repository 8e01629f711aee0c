//! PostgreSQL stores.
//!
//! Tables: `webhook_deliveries`, `webhook_dead_letters`, `webhook_event_logs`.
//! Claims and fenced transitions are single conditional `UPDATE`s, so they
//! stay atomic across worker processes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::infrastructure::postgres::PostgresPool;

use super::models::page_size;
use super::{
    AttemptRecord, ClaimResult, DeadLetterEntry, DeadLetterFilter, DeadLetterStore, Delivery,
    DeliveryFilter, DeliveryStats, DeliveryStatus, DeliveryStore, EventLogEntry, EventLogStore,
    ResetResult, StoreError,
};

const DELIVERY_COLUMNS: &str = "id, endpoint_id, event_type, event_id, payload, status, attempts, \
     max_attempts, last_status_code, last_error, last_response_body, next_retry_at, delivered_at, \
     failed_at, job_id, claim_expires_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    endpoint_id: Uuid,
    event_type: String,
    event_id: String,
    payload: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    last_status_code: Option<i32>,
    last_error: Option<String>,
    last_response_body: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    job_id: Uuid,
    claim_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeliveryRow> for Delivery {
    type Error = StoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<DeliveryStatus>()
            .map_err(|e| StoreError::Serialization(format!("delivery {}: {e}", row.id)))?;

        Ok(Self {
            id: row.id,
            endpoint_id: row.endpoint_id,
            event_type: row.event_type,
            event_id: row.event_id,
            payload: row.payload,
            status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            last_status_code: row.last_status_code.and_then(|c| u16::try_from(c).ok()),
            last_error: row.last_error,
            last_response_body: row.last_response_body,
            next_retry_at: row.next_retry_at,
            delivered_at: row.delivered_at,
            failed_at: row.failed_at,
            job_id: row.job_id,
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PostgresDeliveryStore {
    pool: Arc<PostgresPool>,
}

impl PostgresDeliveryStore {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }

    /// Run a fenced transition: the `UPDATE` must match `id`, `job_id` and a
    /// claimable status. `$1` = id, `$2` = job_id, `$3..=$6` = attempt fields.
    #[allow(clippy::too_many_arguments)]
    async fn fenced_update(
        &self,
        operation: &'static str,
        set_clause: &str,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        extra: FencedExtra,
    ) -> Result<Option<Delivery>, StoreError> {
        let query = format!(
            "UPDATE webhook_deliveries SET \
                attempts = $3, last_status_code = $4, last_error = $5, last_response_body = $6, \
                claim_expires_at = NULL, updated_at = NOW(), {set_clause} \
             WHERE id = $1 AND job_id = $2 AND status IN ('pending', 'retrying') \
             RETURNING {DELIVERY_COLUMNS}"
        );

        let row: Option<DeliveryRow> = self
            .pool
            .execute(operation, |pool| async move {
                let q = sqlx::query_as::<sqlx::Postgres, DeliveryRow>(&query)
                    .bind(id)
                    .bind(job_id)
                    .bind(attempts as i32)
                    .bind(record.status_code.map(i32::from))
                    .bind(record.error.as_deref())
                    .bind(record.response_body.as_deref());
                let q = match extra {
                    FencedExtra::At(at) => q.bind(at),
                    FencedExtra::Retry { at, next_job_id } => q.bind(at).bind(next_job_id),
                };
                q.fetch_optional(&pool).await
            })
            .await?;

        row.map(Delivery::try_from).transpose()
    }
}

/// Extra bind parameters for a fenced transition, starting at `$7`.
enum FencedExtra {
    At(DateTime<Utc>),
    Retry {
        at: DateTime<Utc>,
        next_job_id: Uuid,
    },
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn create(&self, d: &Delivery) -> Result<(), StoreError> {
        self.pool
            .execute("delivery_create", |pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO webhook_deliveries
                        (id, endpoint_id, event_type, event_id, payload, status, attempts,
                         max_attempts, job_id, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "#,
                )
                .bind(d.id)
                .bind(d.endpoint_id)
                .bind(&d.event_type)
                .bind(&d.event_id)
                .bind(&d.payload)
                .bind(d.status.as_str())
                .bind(d.attempts as i32)
                .bind(d.max_attempts as i32)
                .bind(d.job_id)
                .bind(d.created_at)
                .bind(d.updated_at)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.pool
            .execute("delivery_delete", |pool| async move {
                sqlx::query("DELETE FROM webhook_deliveries WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
        let query = format!("SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1");
        let row: Option<DeliveryRow> = self
            .pool
            .execute("delivery_get", |pool| async move {
                sqlx::query_as(&query).bind(id).fetch_optional(&pool).await
            })
            .await?;
        row.map(Delivery::try_from).transpose()
    }

    async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>, StoreError> {
        let query = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE ($1::UUID IS NULL OR endpoint_id = $1) \
               AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC LIMIT $3 OFFSET $4"
        );
        let rows: Vec<DeliveryRow> = self
            .pool
            .execute("delivery_list", |pool| async move {
                sqlx::query_as(&query)
                    .bind(filter.endpoint_id)
                    .bind(filter.status.map(|s| s.as_str()))
                    .bind(page_size(filter.limit) as i64)
                    .bind(filter.offset as i64)
                    .fetch_all(&pool)
                    .await
            })
            .await?;
        rows.into_iter().map(Delivery::try_from).collect()
    }

    async fn stats(&self, endpoint_id: Option<Uuid>) -> Result<DeliveryStats, StoreError> {
        let rows: Vec<(String, i64)> = self
            .pool
            .execute("delivery_stats", |pool| async move {
                sqlx::query_as(
                    r#"
                    SELECT status, COUNT(*) FROM webhook_deliveries
                    WHERE ($1::UUID IS NULL OR endpoint_id = $1)
                    GROUP BY status
                    "#,
                )
                .bind(endpoint_id)
                .fetch_all(&pool)
                .await
            })
            .await?;

        let mut stats = DeliveryStats::default();
        for (status, count) in rows {
            let status = status
                .parse::<DeliveryStatus>()
                .map_err(StoreError::Serialization)?;
            stats.add(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<u64, StoreError> {
        let (count,): (i64,) = self
            .pool
            .execute("delivery_count", |pool| async move {
                sqlx::query_as("SELECT COUNT(*) FROM webhook_deliveries WHERE endpoint_id = $1")
                    .bind(endpoint_id)
                    .fetch_one(&pool)
                    .await
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn claim(
        &self,
        id: Uuid,
        job_id: Uuid,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let query = format!(
            "UPDATE webhook_deliveries SET claim_expires_at = $3, updated_at = $4 \
             WHERE id = $1 AND job_id = $2 AND status IN ('pending', 'retrying') \
               AND (claim_expires_at IS NULL OR claim_expires_at <= $4) \
             RETURNING {DELIVERY_COLUMNS}"
        );
        let row: Option<DeliveryRow> = self
            .pool
            .execute("delivery_claim", |pool| async move {
                sqlx::query_as(&query)
                    .bind(id)
                    .bind(job_id)
                    .bind(lease_until)
                    .bind(now)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        if let Some(row) = row {
            return Ok(ClaimResult::Claimed(Delivery::try_from(row)?));
        }

        // Distinguish an active lease on this job from a superseded job
        match self.get(id).await? {
            Some(d) if d.job_id == job_id && d.status.is_claimable() => Ok(ClaimResult::Busy),
            _ => Ok(ClaimResult::Stale),
        }
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = self
            .fenced_update(
                "delivery_mark_delivered",
                "status = 'delivered', delivered_at = $7, next_retry_at = NULL",
                id,
                job_id,
                attempts,
                record,
                FencedExtra::At(delivered_at),
            )
            .await?;
        Ok(updated.is_some())
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        next_retry_at: DateTime<Utc>,
        next_job_id: Uuid,
    ) -> Result<bool, StoreError> {
        let updated = self
            .fenced_update(
                "delivery_schedule_retry",
                "status = 'retrying', next_retry_at = $7, job_id = $8",
                id,
                job_id,
                attempts,
                record,
                FencedExtra::Retry {
                    at: next_retry_at,
                    next_job_id,
                },
            )
            .await?;
        Ok(updated.is_some())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError> {
        self.fenced_update(
            "delivery_mark_failed",
            "status = 'failed', failed_at = $7, next_retry_at = NULL",
            id,
            job_id,
            attempts,
            record,
            FencedExtra::At(failed_at),
        )
        .await
    }

    async fn reset_for_retry(
        &self,
        id: Uuid,
        next_job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ResetResult, StoreError> {
        let query = format!(
            "UPDATE webhook_deliveries SET \
                status = 'pending', attempts = 0, last_status_code = NULL, last_error = NULL, \
                last_response_body = NULL, next_retry_at = NULL, failed_at = NULL, \
                job_id = $2, claim_expires_at = NULL, updated_at = $3 \
             WHERE id = $1 AND status <> 'delivered' \
               AND (claim_expires_at IS NULL OR claim_expires_at <= $3) \
             RETURNING {DELIVERY_COLUMNS}"
        );
        let row: Option<DeliveryRow> = self
            .pool
            .execute("delivery_reset", |pool| async move {
                sqlx::query_as(&query)
                    .bind(id)
                    .bind(next_job_id)
                    .bind(now)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        if let Some(row) = row {
            return Ok(ResetResult::Reset(Delivery::try_from(row)?));
        }
        match self.get(id).await? {
            Some(d) if d.status != DeliveryStatus::Delivered => Ok(ResetResult::InFlight),
            _ => Ok(ResetResult::Finished),
        }
    }
}

const DEAD_LETTER_COLUMNS: &str = "id, delivery_id, job_id, endpoint_id, endpoint_url, \
     event_type, event_id, payload, error_message, status_code, attempts_made, created_at, \
     retried_at, retry_delivery_id";

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    delivery_id: Uuid,
    job_id: Uuid,
    endpoint_id: Uuid,
    endpoint_url: String,
    event_type: String,
    event_id: String,
    payload: Value,
    error_message: String,
    status_code: Option<i32>,
    attempts_made: i32,
    created_at: DateTime<Utc>,
    retried_at: Option<DateTime<Utc>>,
    retry_delivery_id: Option<Uuid>,
}

impl From<DeadLetterRow> for DeadLetterEntry {
    fn from(row: DeadLetterRow) -> Self {
        Self {
            id: row.id,
            delivery_id: row.delivery_id,
            job_id: row.job_id,
            endpoint_id: row.endpoint_id,
            endpoint_url: row.endpoint_url,
            event_type: row.event_type,
            event_id: row.event_id,
            payload: row.payload,
            error_message: row.error_message,
            status_code: row.status_code.and_then(|c| u16::try_from(c).ok()),
            attempts_made: row.attempts_made.max(0) as u32,
            created_at: row.created_at,
            retried_at: row.retried_at,
            retry_delivery_id: row.retry_delivery_id,
        }
    }
}

pub struct PostgresDeadLetterStore {
    pool: Arc<PostgresPool>,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn insert(&self, e: &DeadLetterEntry) -> Result<DeadLetterEntry, StoreError> {
        let query = format!(
            "INSERT INTO webhook_dead_letters \
                (id, delivery_id, job_id, endpoint_id, endpoint_url, event_type, event_id, \
                 payload, error_message, status_code, attempts_made, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (job_id) DO NOTHING \
             RETURNING {DEAD_LETTER_COLUMNS}"
        );
        let inserted: Option<DeadLetterRow> = self
            .pool
            .execute("dead_letter_insert", |pool| async move {
                sqlx::query_as(&query)
                    .bind(e.id)
                    .bind(e.delivery_id)
                    .bind(e.job_id)
                    .bind(e.endpoint_id)
                    .bind(&e.endpoint_url)
                    .bind(&e.event_type)
                    .bind(&e.event_id)
                    .bind(&e.payload)
                    .bind(&e.error_message)
                    .bind(e.status_code.map(i32::from))
                    .bind(e.attempts_made as i32)
                    .bind(e.created_at)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;
        if let Some(row) = inserted {
            return Ok(row.into());
        }

        let query =
            format!("SELECT {DEAD_LETTER_COLUMNS} FROM webhook_dead_letters WHERE job_id = $1");
        let job_id = e.job_id;
        let existing: DeadLetterRow = self
            .pool
            .execute("dead_letter_get_by_job", |pool| async move {
                sqlx::query_as(&query).bind(job_id).fetch_one(&pool).await
            })
            .await?;
        Ok(existing.into())
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        self.pool
            .execute("dead_letter_remove", |pool| async move {
                sqlx::query("DELETE FROM webhook_dead_letters WHERE id = $1")
                    .bind(id)
                    .execute(&pool)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        let query = format!("SELECT {DEAD_LETTER_COLUMNS} FROM webhook_dead_letters WHERE id = $1");
        let row: Option<DeadLetterRow> = self
            .pool
            .execute("dead_letter_get", |pool| async move {
                sqlx::query_as(&query).bind(id).fetch_optional(&pool).await
            })
            .await?;
        Ok(row.map(DeadLetterEntry::from))
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let query = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM webhook_dead_letters \
             WHERE ($1::UUID IS NULL OR endpoint_id = $1) \
               AND ($2::TEXT IS NULL OR event_type = $2) \
               AND ($3::BOOLEAN IS NULL OR (retried_at IS NOT NULL) = $3) \
             ORDER BY created_at DESC LIMIT $4 OFFSET $5"
        );
        let rows: Vec<DeadLetterRow> = self
            .pool
            .execute("dead_letter_list", |pool| async move {
                sqlx::query_as(&query)
                    .bind(filter.endpoint_id)
                    .bind(filter.event_type.as_deref())
                    .bind(filter.replayed)
                    .bind(page_size(filter.limit) as i64)
                    .bind(filter.offset as i64)
                    .fetch_all(&pool)
                    .await
            })
            .await?;
        Ok(rows.into_iter().map(DeadLetterEntry::from).collect())
    }

    async fn count(&self, replayed: Option<bool>) -> Result<u64, StoreError> {
        let (count,): (i64,) = self
            .pool
            .execute("dead_letter_count", |pool| async move {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM webhook_dead_letters \
                     WHERE ($1::BOOLEAN IS NULL OR (retried_at IS NOT NULL) = $1)",
                )
                .bind(replayed)
                .fetch_one(&pool)
                .await
            })
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        retry_delivery_id: Uuid,
        retried_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .pool
            .execute("dead_letter_mark_retried", |pool| async move {
                sqlx::query(
                    r#"
                    UPDATE webhook_dead_letters
                    SET retried_at = $2, retry_delivery_id = $3
                    WHERE id = $1 AND retried_at IS NULL
                    "#,
                )
                .bind(id)
                .bind(retried_at)
                .bind(retry_delivery_id)
                .execute(&pool)
                .await
            })
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("dead letter {id}"))),
        }
    }
}

#[derive(sqlx::FromRow)]
struct EventLogRow {
    id: Uuid,
    event_type: String,
    event_id: String,
    payload: Value,
    source: String,
    triggered_by: Option<String>,
    endpoint_count: i32,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

pub struct PostgresEventLogStore {
    pool: Arc<PostgresPool>,
}

impl PostgresEventLogStore {
    pub fn new(pool: Arc<PostgresPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventLogStore for PostgresEventLogStore {
    async fn record(&self, e: &EventLogEntry) -> Result<(), StoreError> {
        self.pool
            .execute("event_log_record", |pool| async move {
                sqlx::query(
                    r#"
                    INSERT INTO webhook_event_logs
                        (id, event_type, event_id, payload, source, triggered_by,
                         endpoint_count, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    "#,
                )
                .bind(e.id)
                .bind(&e.event_type)
                .bind(&e.event_id)
                .bind(&e.payload)
                .bind(&e.source)
                .bind(&e.triggered_by)
                .bind(e.endpoint_count as i32)
                .bind(e.created_at)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        endpoint_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = self
            .pool
            .execute("event_log_complete", |pool| async move {
                sqlx::query(
                    "UPDATE webhook_event_logs SET endpoint_count = $2, processed_at = $3 \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(endpoint_count as i32)
                .bind(processed_at)
                .execute(&pool)
                .await
            })
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("event log {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventLogEntry>, StoreError> {
        let row: Option<EventLogRow> = self
            .pool
            .execute("event_log_get", |pool| async move {
                sqlx::query_as(
                    "SELECT id, event_type, event_id, payload, source, triggered_by, \
                     endpoint_count, processed_at, created_at \
                     FROM webhook_event_logs WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&pool)
                .await
            })
            .await?;

        Ok(row.map(|r| EventLogEntry {
            id: r.id,
            event_type: r.event_type,
            event_id: r.event_id,
            payload: r.payload,
            source: r.source,
            triggered_by: r.triggered_by,
            endpoint_count: r.endpoint_count.max(0) as u32,
            processed_at: r.processed_at,
            created_at: r.created_at,
        }))
    }
}
