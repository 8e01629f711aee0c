//! Manual recovery of failed deliveries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::delivery::{AttemptRecord, Delivery, DeliveryStatus, ResetResult, Stores};
use crate::metrics::DeliveryMetrics;
use crate::registry::{Endpoint, EndpointRegistry};
use crate::scheduler::{submit_with_retry, DeliveryJob, JobScheduler};

use super::RecoveryError;

pub struct RecoveryService {
    registry: Arc<dyn EndpointRegistry>,
    stores: Stores,
    scheduler: Arc<dyn JobScheduler>,
}

impl RecoveryService {
    pub fn new(
        registry: Arc<dyn EndpointRegistry>,
        stores: Stores,
        scheduler: Arc<dyn JobScheduler>,
    ) -> Self {
        Self {
            registry,
            stores,
            scheduler,
        }
    }

    /// Restart a delivery from attempt 1. Any job still queued for it is
    /// fenced out by the new job id. Refused while a worker holds the lease.
    #[tracing::instrument(name = "delivery.manual_retry", skip(self))]
    pub async fn retry_delivery(&self, delivery_id: Uuid) -> Result<Delivery, RecoveryError> {
        let delivery = self
            .stores
            .deliveries
            .get(delivery_id)
            .await?
            .ok_or(RecoveryError::DeliveryNotFound(delivery_id))?;
        if delivery.status == DeliveryStatus::Delivered {
            return Err(RecoveryError::AlreadyDelivered(delivery_id));
        }

        let endpoint = self.active_endpoint(delivery.endpoint_id).await?;

        let reset = match self
            .stores
            .deliveries
            .reset_for_retry(delivery_id, Uuid::new_v4(), Utc::now())
            .await?
        {
            ResetResult::Reset(delivery) => delivery,
            ResetResult::InFlight => return Err(RecoveryError::AttemptInFlight(delivery_id)),
            ResetResult::Finished => return Err(RecoveryError::AlreadyDelivered(delivery_id)),
        };

        self.submit_first_attempt(&reset, &endpoint).await?;
        DeliveryMetrics::record_manual_retry("delivery");
        tracing::info!(%delivery_id, "Delivery re-queued at attempt 1");

        Ok(reset)
    }

    /// Replay a dead letter as a brand-new delivery. The entry is kept and
    /// stamped with `retried_at`.
    #[tracing::instrument(name = "dead_letter.replay", skip(self))]
    pub async fn retry_from_dead_letter(
        &self,
        dead_letter_id: Uuid,
    ) -> Result<Delivery, RecoveryError> {
        let entry = self
            .stores
            .dead_letters
            .get(dead_letter_id)
            .await?
            .ok_or(RecoveryError::DeadLetterNotFound(dead_letter_id))?;
        if entry.retried_at.is_some() {
            return Err(RecoveryError::AlreadyReplayed(dead_letter_id));
        }

        let endpoint = self.active_endpoint(entry.endpoint_id).await?;
        let delivery = Delivery::new(
            entry.endpoint_id,
            &entry.event_type,
            &entry.event_id,
            entry.payload.clone(),
        );

        // The entry is stamped only once its delivery exists; a replay that
        // loses the stamp drops the delivery it created
        self.stores.deliveries.create(&delivery).await?;
        match self
            .stores
            .dead_letters
            .mark_retried(dead_letter_id, delivery.id, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.discard(delivery.id).await;
                return Err(RecoveryError::AlreadyReplayed(dead_letter_id));
            }
            Err(e) => {
                self.discard(delivery.id).await;
                return Err(e.into());
            }
        }
        DeliveryMetrics::record_created();
        self.submit_first_attempt(&delivery, &endpoint).await?;
        DeliveryMetrics::record_manual_retry("dead_letter");

        tracing::info!(
            %dead_letter_id,
            delivery_id = %delivery.id,
            original_delivery_id = %entry.delivery_id,
            "Dead letter replayed"
        );

        Ok(delivery)
    }

    async fn discard(&self, delivery_id: Uuid) {
        if let Err(e) = self.stores.deliveries.delete(delivery_id).await {
            tracing::warn!(
                %delivery_id,
                error = %e,
                "Failed to discard unscheduled replay delivery"
            );
        }
    }

    async fn active_endpoint(&self, endpoint_id: Uuid) -> Result<Endpoint, RecoveryError> {
        let endpoint = self
            .registry
            .get_endpoint(endpoint_id)
            .await?
            .ok_or(RecoveryError::EndpointNotFound(endpoint_id))?;
        if !endpoint.is_active {
            return Err(RecoveryError::EndpointInactive(endpoint_id));
        }
        Ok(endpoint)
    }

    /// Submit attempt 1. If the scheduler stays down the delivery is
    /// dead-lettered rather than left pending without a job.
    async fn submit_first_attempt(
        &self,
        delivery: &Delivery,
        endpoint: &Endpoint,
    ) -> Result<(), RecoveryError> {
        let job = DeliveryJob {
            job_id: delivery.job_id,
            delivery_id: delivery.id,
            endpoint_id: endpoint.id,
            url: endpoint.url.clone(),
            secret: endpoint.secret.clone(),
            event_type: delivery.event_type.clone(),
            event_id: delivery.event_id.clone(),
            payload: delivery.payload.clone(),
            attempt: 1,
        };

        if let Err(e) = submit_with_retry(self.scheduler.as_ref(), &job, Duration::ZERO).await {
            let record = AttemptRecord {
                error: Some(format!("scheduling failed: {e}")),
                ..Default::default()
            };
            self.stores
                .fail_and_dead_letter(delivery.id, delivery.job_id, 0, &record, &endpoint.url)
                .await?;
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;

    use crate::delivery::{
        ClaimResult, DeadLetterEntry, DeliveryFilter, DeliveryStats, DeliveryStore,
        MemoryDeliveryStore, StoreError,
    };
    use crate::registry::{Endpoints, NewEndpoint};
    use crate::scheduler::MemoryJobScheduler;

    /// Memory delivery store whose creates fail while `down` is set.
    #[derive(Default)]
    struct FlakyDeliveries {
        inner: MemoryDeliveryStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl DeliveryStore for FlakyDeliveries {
        async fn create(&self, delivery: &Delivery) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("db down".to_string()));
            }
            self.inner.create(delivery).await
        }

        async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.delete(id).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>, StoreError> {
            self.inner.list(filter).await
        }

        async fn stats(&self, endpoint_id: Option<Uuid>) -> Result<DeliveryStats, StoreError> {
            self.inner.stats(endpoint_id).await
        }

        async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<u64, StoreError> {
            self.inner.count_for_endpoint(endpoint_id).await
        }

        async fn claim(
            &self,
            id: Uuid,
            job_id: Uuid,
            lease_until: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<ClaimResult, StoreError> {
            self.inner.claim(id, job_id, lease_until, now).await
        }

        async fn mark_delivered(
            &self,
            id: Uuid,
            job_id: Uuid,
            attempts: u32,
            record: &AttemptRecord,
            delivered_at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner
                .mark_delivered(id, job_id, attempts, record, delivered_at)
                .await
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
            self.inner
                .schedule_retry(id, job_id, attempts, record, next_retry_at, next_job_id)
                .await
        }

        async fn mark_failed(
            &self,
            id: Uuid,
            job_id: Uuid,
            attempts: u32,
            record: &AttemptRecord,
            failed_at: DateTime<Utc>,
        ) -> Result<Option<Delivery>, StoreError> {
            self.inner
                .mark_failed(id, job_id, attempts, record, failed_at)
                .await
        }

        async fn reset_for_retry(
            &self,
            id: Uuid,
            next_job_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<ResetResult, StoreError> {
            self.inner.reset_for_retry(id, next_job_id, now).await
        }
    }

    struct Fixture {
        endpoints: Endpoints,
        stores: Stores,
        scheduler: Arc<MemoryJobScheduler>,
        recovery: RecoveryService,
    }

    fn fixture() -> Fixture {
        let endpoints = Endpoints::memory();
        let stores = Stores::memory();
        let scheduler = Arc::new(MemoryJobScheduler::new(Duration::from_secs(60)));
        let recovery =
            RecoveryService::new(endpoints.registry.clone(), stores.clone(), scheduler.clone());
        Fixture {
            endpoints,
            stores,
            scheduler,
            recovery,
        }
    }

    async fn failed_delivery(fx: &Fixture) -> (Endpoint, Delivery) {
        let endpoint = fx
            .endpoints
            .admin
            .create(NewEndpoint {
                url: "https://example.com/hook".to_string(),
                events: vec!["order.created".to_string()],
                owner_id: None,
                metadata: None,
            })
            .await
            .unwrap();
        let delivery = Delivery::new(endpoint.id, "order.created", "evt_9", json!({"n": 9}));
        fx.stores.deliveries.create(&delivery).await.unwrap();
        let record = AttemptRecord {
            status_code: Some(500),
            error: Some("HTTP 500".to_string()),
            response_body: None,
        };
        let failed = fx
            .stores
            .deliveries
            .mark_failed(delivery.id, delivery.job_id, 5, &record, Utc::now())
            .await
            .unwrap()
            .unwrap();
        (endpoint, failed)
    }

    #[tokio::test]
    async fn test_retry_delivery_resets_and_requeues() {
        let fx = fixture();
        let (_, failed) = failed_delivery(&fx).await;

        let reset = fx.recovery.retry_delivery(failed.id).await.unwrap();

        assert_eq!(reset.id, failed.id);
        assert_eq!(reset.status, DeliveryStatus::Pending);
        assert_eq!(reset.attempts, 0);
        assert!(reset.last_error.is_none());
        assert_ne!(reset.job_id, failed.job_id);

        let jobs = fx.scheduler.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, reset.job_id);
        assert_eq!(jobs[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_retry_delivered_is_rejected() {
        let fx = fixture();
        let (_, failed) = failed_delivery(&fx).await;
        let other = Delivery::new(failed.endpoint_id, "order.created", "evt_2", json!({}));
        fx.stores.deliveries.create(&other).await.unwrap();
        fx.stores
            .deliveries
            .mark_delivered(other.id, other.job_id, 1, &AttemptRecord::default(), Utc::now())
            .await
            .unwrap();

        let err = fx.recovery.retry_delivery(other.id).await.unwrap_err();
        assert!(matches!(err, RecoveryError::AlreadyDelivered(_)));

        let err = fx.recovery.retry_delivery(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RecoveryError::DeliveryNotFound(_)));
    }

    #[tokio::test]
    async fn test_replay_creates_new_delivery_and_keeps_entry() {
        let fx = fixture();
        let (endpoint, failed) = failed_delivery(&fx).await;
        let entry = DeadLetterEntry::from_delivery(&failed, &endpoint.url);
        fx.stores.dead_letters.insert(&entry).await.unwrap();

        let replay = fx.recovery.retry_from_dead_letter(entry.id).await.unwrap();

        assert_ne!(replay.id, failed.id);
        assert_eq!(replay.attempts, 0);
        assert_eq!(replay.event_id, "evt_9");
        assert_eq!(replay.payload, json!({"n": 9}));

        let kept = fx.stores.dead_letters.get(entry.id).await.unwrap().unwrap();
        assert!(kept.retried_at.is_some());
        assert_eq!(kept.retry_delivery_id, Some(replay.id));
        assert_eq!(kept.error_message, "HTTP 500");
        assert_eq!(kept.payload, json!({"n": 9}));

        let all = fx.stores.deliveries.list(&DeliveryFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let err = fx.recovery.retry_from_dead_letter(entry.id).await.unwrap_err();
        assert!(matches!(err, RecoveryError::AlreadyReplayed(_)));
    }

    #[tokio::test]
    async fn test_replay_to_inactive_endpoint_rejected() {
        let fx = fixture();
        let (endpoint, failed) = failed_delivery(&fx).await;
        let entry = DeadLetterEntry::from_delivery(&failed, &endpoint.url);
        fx.stores.dead_letters.insert(&entry).await.unwrap();
        fx.endpoints.admin.deactivate(endpoint.id).await.unwrap();

        let err = fx.recovery.retry_from_dead_letter(entry.id).await.unwrap_err();
        assert!(matches!(err, RecoveryError::EndpointInactive(_)));

        let kept = fx.stores.dead_letters.get(entry.id).await.unwrap().unwrap();
        assert!(kept.retried_at.is_none());
    }

    #[tokio::test]
    async fn test_retry_refused_while_attempt_in_flight() {
        let fx = fixture();
        let endpoint = fx
            .endpoints
            .admin
            .create(NewEndpoint {
                url: "https://example.com/hook".to_string(),
                events: vec!["order.created".to_string()],
                owner_id: None,
                metadata: None,
            })
            .await
            .unwrap();
        let delivery = Delivery::new(endpoint.id, "order.created", "evt_3", json!({}));
        fx.stores.deliveries.create(&delivery).await.unwrap();

        let now = Utc::now();
        fx.stores
            .deliveries
            .claim(delivery.id, delivery.job_id, now + chrono::Duration::seconds(90), now)
            .await
            .unwrap();

        let err = fx.recovery.retry_delivery(delivery.id).await.unwrap_err();
        assert!(matches!(err, RecoveryError::AttemptInFlight(_)));

        let stored = fx.stores.deliveries.get(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.job_id, delivery.job_id);
        assert!(fx.scheduler.claim_due(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_survives_failed_delivery_create() {
        let deliveries = Arc::new(FlakyDeliveries::default());
        let endpoints = Endpoints::memory();
        let mut stores = Stores::memory();
        stores.deliveries = deliveries.clone() as Arc<dyn DeliveryStore>;
        let scheduler = Arc::new(MemoryJobScheduler::new(Duration::from_secs(60)));
        let recovery =
            RecoveryService::new(endpoints.registry.clone(), stores.clone(), scheduler.clone());
        let fx = Fixture {
            endpoints,
            stores,
            scheduler,
            recovery,
        };

        let (endpoint, failed) = failed_delivery(&fx).await;
        let entry = DeadLetterEntry::from_delivery(&failed, &endpoint.url);
        fx.stores.dead_letters.insert(&entry).await.unwrap();

        deliveries.down.store(true, Ordering::SeqCst);
        let err = fx.recovery.retry_from_dead_letter(entry.id).await.unwrap_err();
        assert!(matches!(err, RecoveryError::Store(_)));

        let kept = fx.stores.dead_letters.get(entry.id).await.unwrap().unwrap();
        assert!(kept.retried_at.is_none());
        assert!(kept.retry_delivery_id.is_none());

        deliveries.down.store(false, Ordering::SeqCst);
        let replay = fx.recovery.retry_from_dead_letter(entry.id).await.unwrap();

        let kept = fx.stores.dead_letters.get(entry.id).await.unwrap().unwrap();
        assert_eq!(kept.retry_delivery_id, Some(replay.id));
        let jobs = fx.scheduler.claim_due(Utc::now(), 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].delivery_id, replay.id);
    }
}
