//! One delivery attempt, from claim to the next state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::delivery::{
    delay_before_attempt, AttemptRecord, ClaimResult, Delivery, StoreError, Stores, MAX_ATTEMPTS,
};
use crate::metrics::DeliveryMetrics;
use crate::scheduler::{submit_with_retry, DeliveryJob, JobScheduler};

use super::client::{AttemptOutcome, WebhookClient};

/// What became of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Delivered,
    RetryScheduled {
        next_attempt: u32,
        run_at: DateTime<Utc>,
    },
    DeadLettered,
    /// The job was superseded or the delivery is already terminal
    Skipped,
    /// Another worker holds the lease for this job
    Busy,
}

pub struct DeliveryWorker {
    stores: Stores,
    scheduler: Arc<dyn JobScheduler>,
    client: WebhookClient,
    claim_lease: chrono::Duration,
}

impl DeliveryWorker {
    pub fn new(
        stores: Stores,
        scheduler: Arc<dyn JobScheduler>,
        client: WebhookClient,
        claim_lease: Duration,
    ) -> Self {
        Self {
            stores,
            scheduler,
            client,
            claim_lease: chrono::Duration::from_std(claim_lease)
                .unwrap_or_else(|_| chrono::Duration::seconds(90)),
        }
    }

    /// Process a claimed job and acknowledge it once its outcome is durable.
    ///
    /// Busy jobs and jobs that hit a store error stay unacknowledged so the
    /// scheduler hands them out again after the visibility timeout.
    pub async fn handle(&self, job: DeliveryJob) -> Option<ProcessOutcome> {
        let outcome = match self.process(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    delivery_id = %job.delivery_id,
                    error = %e,
                    "Delivery processing failed, leaving job for redelivery"
                );
                return None;
            }
        };

        if outcome != ProcessOutcome::Busy {
            if let Err(e) = self.scheduler.ack(job.job_id).await {
                tracing::warn!(job_id = %job.job_id, error = %e, "Failed to acknowledge job");
            }
        }

        Some(outcome)
    }

    #[tracing::instrument(
        name = "delivery.process",
        skip(self, job),
        fields(
            delivery_id = %job.delivery_id,
            endpoint_id = %job.endpoint_id,
            event_type = %job.event_type,
            job_id = %job.job_id
        )
    )]
    pub async fn process(&self, job: &DeliveryJob) -> Result<ProcessOutcome, StoreError> {
        let now = Utc::now();
        let claim = self
            .stores
            .deliveries
            .claim(job.delivery_id, job.job_id, now + self.claim_lease, now)
            .await?;

        let delivery = match claim {
            ClaimResult::Claimed(delivery) => delivery,
            ClaimResult::Busy => {
                tracing::debug!("Delivery leased by another worker");
                return Ok(ProcessOutcome::Busy);
            }
            ClaimResult::Stale => {
                DeliveryMetrics::record_skipped();
                tracing::debug!("Stale job, delivery already moved on");
                return Ok(ProcessOutcome::Skipped);
            }
        };

        let attempt = delivery.attempts + 1;
        let outcome = self.client.send(job).await;
        let record = AttemptRecord {
            status_code: outcome.status_code,
            error: outcome.error.as_ref().map(|e| e.to_string()),
            response_body: outcome.response_body.clone(),
        };

        if outcome.is_success() {
            return self.on_success(job, attempt, &record, &outcome).await;
        }

        DeliveryMetrics::record_failure(outcome.latency);
        tracing::info!(
            attempt,
            max_attempts = delivery.max_attempts,
            status_code = ?outcome.status_code,
            error = record.error.as_deref().unwrap_or_default(),
            "Delivery attempt failed"
        );

        if attempt >= delivery.max_attempts {
            return self.dead_letter(job, job.job_id, attempt, &record).await;
        }
        self.schedule_retry(job, &delivery, attempt, record).await
    }

    async fn on_success(
        &self,
        job: &DeliveryJob,
        attempt: u32,
        record: &AttemptRecord,
        outcome: &AttemptOutcome,
    ) -> Result<ProcessOutcome, StoreError> {
        let applied = self
            .stores
            .deliveries
            .mark_delivered(job.delivery_id, job.job_id, attempt, record, Utc::now())
            .await?;

        if !applied {
            tracing::warn!("Delivered, but the delivery was superseded meanwhile");
            return Ok(ProcessOutcome::Skipped);
        }

        DeliveryMetrics::record_success(outcome.latency);
        tracing::info!(
            attempt,
            status_code = ?outcome.status_code,
            latency_ms = outcome.latency.as_millis() as u64,
            "Webhook delivered"
        );
        Ok(ProcessOutcome::Delivered)
    }

    async fn schedule_retry(
        &self,
        job: &DeliveryJob,
        delivery: &Delivery,
        attempt: u32,
        record: AttemptRecord,
    ) -> Result<ProcessOutcome, StoreError> {
        let next_attempt = attempt + 1;
        let delay = delay_before_attempt(next_attempt)
            .or_else(|| delay_before_attempt(MAX_ATTEMPTS))
            .unwrap_or(Duration::ZERO);
        let next_retry_at = crate::scheduler::run_at(Utc::now(), delay);

        let next_job = DeliveryJob {
            job_id: Uuid::new_v4(),
            attempt: next_attempt,
            ..job.clone()
        };

        let applied = self
            .stores
            .deliveries
            .schedule_retry(
                delivery.id,
                job.job_id,
                attempt,
                &record,
                next_retry_at,
                next_job.job_id,
            )
            .await?;
        if !applied {
            tracing::warn!("Delivery superseded before its retry could be recorded");
            return Ok(ProcessOutcome::Skipped);
        }

        match submit_with_retry(self.scheduler.as_ref(), &next_job, delay).await {
            Ok(handle) => {
                tracing::info!(
                    next_attempt,
                    run_at = %handle.run_at,
                    delay_secs = delay.as_secs(),
                    "Retry scheduled"
                );
                Ok(ProcessOutcome::RetryScheduled {
                    next_attempt,
                    run_at: handle.run_at,
                })
            }
            Err(e) => {
                let record = AttemptRecord {
                    error: Some(format!(
                        "{}; retry scheduling failed: {}",
                        record.error.as_deref().unwrap_or("delivery failed"),
                        e
                    )),
                    ..record
                };
                self.dead_letter(job, next_job.job_id, attempt, &record).await
            }
        }
    }

    async fn dead_letter(
        &self,
        job: &DeliveryJob,
        fence: Uuid,
        attempts: u32,
        record: &AttemptRecord,
    ) -> Result<ProcessOutcome, StoreError> {
        match self
            .stores
            .fail_and_dead_letter(job.delivery_id, fence, attempts, record, &job.url)
            .await?
        {
            Some(_) => Ok(ProcessOutcome::DeadLettered),
            None => Ok(ProcessOutcome::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::scheduler::{test_job, MemoryJobScheduler};
    use serde_json::json;

    fn worker(stores: Stores, scheduler: Arc<MemoryJobScheduler>) -> DeliveryWorker {
        DeliveryWorker::new(
            stores,
            scheduler,
            WebhookClient::new(&DeliveryConfig::default()).unwrap(),
            Duration::from_secs(90),
        )
    }

    async fn queued(stores: &Stores, scheduler: &MemoryJobScheduler) -> (Delivery, DeliveryJob) {
        let delivery = Delivery::new(Uuid::new_v4(), "order.created", "evt_1", json!({"id": 1}));
        stores.deliveries.create(&delivery).await.unwrap();
        let job = DeliveryJob {
            job_id: delivery.job_id,
            delivery_id: delivery.id,
            endpoint_id: delivery.endpoint_id,
            ..test_job(1)
        };
        scheduler.submit(job.clone(), Duration::ZERO).await.unwrap();
        (delivery, job)
    }

    #[tokio::test]
    async fn test_stale_job_is_acked_without_side_effects() {
        let stores = Stores::memory();
        let scheduler = Arc::new(MemoryJobScheduler::new(Duration::from_secs(60)));
        let (delivery, job) = queued(&stores, &scheduler).await;

        // Superseded by a manual retry
        stores
            .deliveries
            .reset_for_retry(delivery.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap();

        let worker = worker(stores.clone(), scheduler.clone());
        assert_eq!(worker.handle(job).await, Some(ProcessOutcome::Skipped));
        assert_eq!(scheduler.pending().await.unwrap(), 0);

        let stored = stores.deliveries.get(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_leased_delivery_is_left_for_redelivery() {
        let stores = Stores::memory();
        let scheduler = Arc::new(MemoryJobScheduler::new(Duration::from_secs(60)));
        let (delivery, job) = queued(&stores, &scheduler).await;

        let now = Utc::now();
        let claim = stores
            .deliveries
            .claim(delivery.id, job.job_id, now + chrono::Duration::seconds(90), now)
            .await
            .unwrap();
        assert!(matches!(claim, ClaimResult::Claimed(_)));

        let worker = worker(stores.clone(), scheduler.clone());
        assert_eq!(worker.handle(job).await, Some(ProcessOutcome::Busy));
        assert_eq!(scheduler.pending().await.unwrap(), 1);
    }
}
