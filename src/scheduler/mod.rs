//! Delayed job scheduler.
//!
//! Jobs are handed out no earlier than their due time. Handoff is
//! at-least-once: a claimed job that is not acknowledged within the
//! visibility timeout is handed out again. Duplicate handoffs are absorbed
//! by the delivery claim, not here.

mod memory_backend;
mod redis_backend;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::infrastructure::redis::{PoolError, RedisPool};
use crate::infrastructure::{retry_with_backoff, BackoffConfig};
use crate::metrics::SchedulerMetrics;

pub use memory_backend::MemoryJobScheduler;
pub use redis_backend::RedisJobScheduler;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Redis error: {0}")]
    Redis(#[from] PoolError),

    #[error("Job serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Everything a worker needs to make one delivery attempt.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub job_id: Uuid,
    pub delivery_id: Uuid,
    pub endpoint_id: Uuid,
    pub url: String,
    pub secret: String,
    pub event_type: String,
    pub event_id: String,
    pub payload: Value,
    /// 1-based attempt this job performs
    pub attempt: u32,
}

impl fmt::Debug for DeliveryJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryJob")
            .field("job_id", &self.job_id)
            .field("delivery_id", &self.delivery_id)
            .field("endpoint_id", &self.endpoint_id)
            .field("url", &self.url)
            .field("secret", &"[REDACTED]")
            .field("event_type", &self.event_type)
            .field("event_id", &self.event_id)
            .field("attempt", &self.attempt)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub job_id: Uuid,
    pub run_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Schedule `job` to become due after `delay`.
    async fn submit(&self, job: DeliveryJob, delay: Duration) -> Result<JobHandle, SchedulerError>;

    /// Hand out up to `limit` jobs due at `now`. Each must be acked.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryJob>, SchedulerError>;

    /// Forget a claimed job for good.
    async fn ack(&self, job_id: Uuid) -> Result<(), SchedulerError>;

    /// Jobs scheduled or in flight.
    async fn pending(&self) -> Result<usize, SchedulerError>;

    fn backend_type(&self) -> &'static str;
}

pub(crate) fn run_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
}

const SUBMIT_TRIES: u32 = 3;

/// Submit `job`, retrying transient scheduler failures with exponential
/// backoff before giving up.
pub async fn submit_with_retry(
    scheduler: &dyn JobScheduler,
    job: &DeliveryJob,
    delay: Duration,
) -> Result<JobHandle, SchedulerError> {
    let result = retry_with_backoff(BackoffConfig::default(), SUBMIT_TRIES, || {
        scheduler.submit(job.clone(), delay)
    })
    .await;

    match &result {
        Ok(handle) => {
            SchedulerMetrics::record_submitted();
            tracing::debug!(
                job_id = %handle.job_id,
                delivery_id = %job.delivery_id,
                attempt = job.attempt,
                run_at = %handle.run_at,
                "Delivery job submitted"
            );
        }
        Err(e) => {
            SchedulerMetrics::record_submit_failure();
            tracing::error!(
                job_id = %job.job_id,
                delivery_id = %job.delivery_id,
                error = %e,
                "Giving up submitting delivery job"
            );
        }
    }

    result
}

/// Create a job scheduler based on configuration.
///
/// `"redis"` needs a pool; without one this falls back to memory.
pub fn create_job_scheduler(
    settings: &SchedulerConfig,
    redis_pool: Option<Arc<RedisPool>>,
) -> Arc<dyn JobScheduler> {
    let visibility_timeout = Duration::from_secs(settings.visibility_timeout_seconds);

    match settings.backend.as_str() {
        "redis" => {
            if let Some(pool) = redis_pool {
                tracing::info!(
                    backend = "redis",
                    prefix = %settings.redis_prefix,
                    "Creating Redis job scheduler"
                );
                Arc::new(RedisJobScheduler::new(
                    pool,
                    settings.redis_prefix.clone(),
                    visibility_timeout,
                ))
            } else {
                tracing::warn!(
                    "Redis scheduler requested but no pool provided, falling back to memory"
                );
                Arc::new(MemoryJobScheduler::new(visibility_timeout))
            }
        }
        _ => {
            tracing::info!(backend = "memory", "Creating memory job scheduler");
            Arc::new(MemoryJobScheduler::new(visibility_timeout))
        }
    }
}

#[cfg(test)]
pub(crate) fn test_job(attempt: u32) -> DeliveryJob {
    DeliveryJob {
        job_id: Uuid::new_v4(),
        delivery_id: Uuid::new_v4(),
        endpoint_id: Uuid::new_v4(),
        url: "https://example.com/hook".to_string(),
        secret: "s3cret".to_string(),
        event_type: "order.created".to_string(),
        event_id: "evt_1".to_string(),
        payload: serde_json::json!({"id": 1}),
        attempt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let job = test_job(1);
        let debug = format!("{:?}", job);
        assert!(!debug.contains("s3cret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_factory_falls_back_to_memory() {
        let settings = SchedulerConfig {
            backend: "redis".to_string(),
            ..Default::default()
        };
        assert_eq!(create_job_scheduler(&settings, None).backend_type(), "memory");
    }

    #[tokio::test]
    async fn test_submit_with_retry_returns_handle() {
        let scheduler = MemoryJobScheduler::new(Duration::from_secs(60));
        let job = test_job(1);
        let handle = submit_with_retry(&scheduler, &job, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(handle.job_id, job.job_id);
        assert_eq!(scheduler.pending().await.unwrap(), 1);
    }
}
