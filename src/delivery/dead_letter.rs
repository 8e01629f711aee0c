use chrono::Utc;
use uuid::Uuid;

use crate::infrastructure::{retry_with_backoff, BackoffConfig};
use crate::metrics::DeliveryMetrics;

use super::{AttemptRecord, DeadLetterEntry, StoreError, Stores};

const DEAD_LETTER_WRITE_TRIES: u32 = 3;

impl Stores {
    /// Archive a delivery as a dead letter, then mark it `failed`.
    ///
    /// Both steps are fenced on `job_id`; when the delivery has moved on
    /// nothing is written and `None` is returned. The entry is written
    /// first and is idempotent per job, so an error at either step leaves
    /// the delivery claimable by a redelivered job instead of `failed`
    /// without an entry.
    #[tracing::instrument(name = "delivery.dead_letter", skip(self, record, endpoint_url))]
    pub async fn fail_and_dead_letter(
        &self,
        delivery_id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        endpoint_url: &str,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        let current = match self.deliveries.get(delivery_id).await? {
            Some(d) if d.job_id == job_id && d.status.is_claimable() => d,
            _ => {
                tracing::debug!(%delivery_id, "Delivery already moved on, not dead-lettering");
                return Ok(None);
            }
        };

        let mut last = current;
        last.attempts = attempts;
        last.last_status_code = record.status_code;
        last.last_error = record.error.clone();
        let candidate = DeadLetterEntry::from_delivery(&last, endpoint_url);

        let entry = retry_with_backoff(BackoffConfig::default(), DEAD_LETTER_WRITE_TRIES, || {
            self.dead_letters.insert(&candidate)
        })
        .await
        .map_err(|e| {
            tracing::error!(%delivery_id, error = %e, "Failed to write dead letter entry");
            e
        })?;

        let failed = self
            .deliveries
            .mark_failed(delivery_id, job_id, attempts, record, Utc::now())
            .await?;
        if failed.is_none() {
            // Superseded between the check and the update
            if let Err(e) = self.dead_letters.remove(entry.id).await {
                tracing::warn!(
                    %delivery_id,
                    dead_letter_id = %entry.id,
                    error = %e,
                    "Failed to remove dead letter for superseded delivery"
                );
            }
            return Ok(None);
        }

        DeliveryMetrics::record_dead_lettered();
        tracing::warn!(
            %delivery_id,
            dead_letter_id = %entry.id,
            endpoint_id = %entry.endpoint_id,
            attempts = entry.attempts_made,
            error = %entry.error_message,
            "Delivery moved to dead letter queue"
        );

        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    use crate::delivery::{
        DeadLetterFilter, DeadLetterStore, Delivery, DeliveryStatus, MemoryDeadLetterStore,
    };

    /// Memory dead-letter store whose inserts fail while `down` is set.
    #[derive(Default)]
    struct FlakyDeadLetters {
        inner: MemoryDeadLetterStore,
        down: AtomicBool,
    }

    #[async_trait]
    impl DeadLetterStore for FlakyDeadLetters {
        async fn insert(&self, entry: &DeadLetterEntry) -> Result<DeadLetterEntry, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("db down".to_string()));
            }
            self.inner.insert(entry).await
        }

        async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.remove(id).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(
            &self,
            filter: &DeadLetterFilter,
        ) -> Result<Vec<DeadLetterEntry>, StoreError> {
            self.inner.list(filter).await
        }

        async fn count(&self, replayed: Option<bool>) -> Result<u64, StoreError> {
            self.inner.count(replayed).await
        }

        async fn mark_retried(
            &self,
            id: Uuid,
            retry_delivery_id: Uuid,
            retried_at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.mark_retried(id, retry_delivery_id, retried_at).await
        }
    }

    fn failure(code: u16) -> AttemptRecord {
        AttemptRecord {
            status_code: Some(code),
            error: Some(format!("HTTP {code}")),
            response_body: Some("boom".to_string()),
        }
    }

    #[tokio::test]
    async fn test_fail_and_dead_letter_writes_entry() {
        let stores = Stores::memory();
        let delivery = Delivery::new(Uuid::new_v4(), "order.created", "evt_1", json!({"a": 1}));
        stores.deliveries.create(&delivery).await.unwrap();

        let entry = stores
            .fail_and_dead_letter(
                delivery.id,
                delivery.job_id,
                5,
                &failure(500),
                "https://example.com/hook",
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(entry.delivery_id, delivery.id);
        assert_eq!(entry.attempts_made, 5);
        assert_eq!(entry.status_code, Some(500));
        assert_eq!(entry.error_message, "HTTP 500");

        let stored = stores.deliveries.get(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert!(stored.failed_at.is_some());
        assert_eq!(stores.dead_letters.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_job_does_not_dead_letter() {
        let stores = Stores::memory();
        let delivery = Delivery::new(Uuid::new_v4(), "order.created", "evt_1", json!({}));
        stores.deliveries.create(&delivery).await.unwrap();

        let result = stores
            .fail_and_dead_letter(delivery.id, Uuid::new_v4(), 5, &failure(500), "https://x.io")
            .await
            .unwrap();

        assert!(result.is_none());
        assert_eq!(stores.dead_letters.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_archive_leaves_delivery_claimable() {
        let dead_letters = Arc::new(FlakyDeadLetters::default());
        let mut stores = Stores::memory();
        stores.dead_letters = dead_letters.clone() as Arc<dyn DeadLetterStore>;

        let delivery = Delivery::new(Uuid::new_v4(), "order.created", "evt_1", json!({}));
        stores.deliveries.create(&delivery).await.unwrap();

        dead_letters.down.store(true, Ordering::SeqCst);
        let err = stores
            .fail_and_dead_letter(delivery.id, delivery.job_id, 5, &failure(500), "https://x.io")
            .await;
        assert!(err.is_err());

        let stored = stores.deliveries.get(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.job_id, delivery.job_id);

        // The redelivered job archives and fails it exactly once
        dead_letters.down.store(false, Ordering::SeqCst);
        let entry = stores
            .fail_and_dead_letter(delivery.id, delivery.job_id, 5, &failure(500), "https://x.io")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.job_id, delivery.job_id);
        assert_eq!(entry.attempts_made, 5);

        let stored = stores.deliveries.get(delivery.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Failed);
        assert_eq!(stores.dead_letters.count(None).await.unwrap(), 1);
    }
}
