//! In-memory stores using DashMap.
//!
//! A `DashMap` entry guard is held for the whole check-and-update of each
//! conditional write, which makes claims and fenced transitions atomic
//! within the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::models::page_size;
use super::{
    AttemptRecord, ClaimResult, DeadLetterEntry, DeadLetterFilter, DeadLetterStore, Delivery,
    DeliveryFilter, DeliveryStats, DeliveryStatus, DeliveryStore, EventLogEntry, EventLogStore,
    ResetResult, StoreError,
};

#[derive(Default)]
pub struct MemoryDeliveryStore {
    deliveries: DashMap<Uuid, Delivery>,
}

impl MemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `f` if the delivery's current job is `job_id` and it is not
    /// terminal. Returns the updated record.
    fn fenced_update<F>(&self, id: Uuid, job_id: Uuid, f: F) -> Option<Delivery>
    where
        F: FnOnce(&mut Delivery),
    {
        let mut entry = self.deliveries.get_mut(&id)?;
        if entry.job_id != job_id || !entry.status.is_claimable() {
            return None;
        }
        f(entry.value_mut());
        entry.claim_expires_at = None;
        entry.updated_at = Utc::now();
        Some(entry.value().clone())
    }
}

fn apply_record(delivery: &mut Delivery, attempts: u32, record: &AttemptRecord) {
    delivery.attempts = attempts;
    delivery.last_status_code = record.status_code;
    delivery.last_error = record.error.clone();
    delivery.last_response_body = record.response_body.clone();
}

#[async_trait]
impl DeliveryStore for MemoryDeliveryStore {
    async fn create(&self, delivery: &Delivery) -> Result<(), StoreError> {
        self.deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.deliveries.remove(&id);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Delivery>, StoreError> {
        Ok(self.deliveries.get(&id).map(|d| d.value().clone()))
    }

    async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>, StoreError> {
        let mut matches: Vec<Delivery> = self
            .deliveries
            .iter()
            .filter(|d| filter.endpoint_id.map_or(true, |id| d.endpoint_id == id))
            .filter(|d| filter.status.map_or(true, |s| d.status == s))
            .map(|d| d.value().clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matches
            .into_iter()
            .skip(filter.offset)
            .take(page_size(filter.limit))
            .collect())
    }

    async fn stats(&self, endpoint_id: Option<Uuid>) -> Result<DeliveryStats, StoreError> {
        let mut stats = DeliveryStats::default();
        for d in self.deliveries.iter() {
            if endpoint_id.map_or(true, |id| d.endpoint_id == id) {
                stats.add(d.status, 1);
            }
        }
        Ok(stats)
    }

    async fn count_for_endpoint(&self, endpoint_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .deliveries
            .iter()
            .filter(|d| d.endpoint_id == endpoint_id)
            .count() as u64)
    }

    async fn claim(
        &self,
        id: Uuid,
        job_id: Uuid,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let Some(mut entry) = self.deliveries.get_mut(&id) else {
            return Ok(ClaimResult::Stale);
        };

        if entry.job_id != job_id || !entry.status.is_claimable() {
            return Ok(ClaimResult::Stale);
        }
        if entry.claim_expires_at.is_some_and(|lease| lease > now) {
            return Ok(ClaimResult::Busy);
        }

        entry.claim_expires_at = Some(lease_until);
        entry.updated_at = now;
        Ok(ClaimResult::Claimed(entry.value().clone()))
    }

    async fn mark_delivered(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .fenced_update(id, job_id, |d| {
                apply_record(d, attempts, record);
                d.status = DeliveryStatus::Delivered;
                d.delivered_at = Some(delivered_at);
                d.next_retry_at = None;
            })
            .is_some())
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
        Ok(self
            .fenced_update(id, job_id, |d| {
                apply_record(d, attempts, record);
                d.status = DeliveryStatus::Retrying;
                d.next_retry_at = Some(next_retry_at);
                d.job_id = next_job_id;
            })
            .is_some())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        job_id: Uuid,
        attempts: u32,
        record: &AttemptRecord,
        failed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>, StoreError> {
        Ok(self.fenced_update(id, job_id, |d| {
            apply_record(d, attempts, record);
            d.status = DeliveryStatus::Failed;
            d.failed_at = Some(failed_at);
            d.next_retry_at = None;
        }))
    }

    async fn reset_for_retry(
        &self,
        id: Uuid,
        next_job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ResetResult, StoreError> {
        let Some(mut entry) = self.deliveries.get_mut(&id) else {
            return Ok(ResetResult::Finished);
        };
        if entry.status == DeliveryStatus::Delivered {
            return Ok(ResetResult::Finished);
        }
        if entry.claim_expires_at.is_some_and(|lease| lease > now) {
            return Ok(ResetResult::InFlight);
        }

        let d = entry.value_mut();
        d.status = DeliveryStatus::Pending;
        d.attempts = 0;
        d.last_status_code = None;
        d.last_error = None;
        d.last_response_body = None;
        d.next_retry_at = None;
        d.failed_at = None;
        d.job_id = next_job_id;
        d.claim_expires_at = None;
        d.updated_at = now;
        Ok(ResetResult::Reset(d.clone()))
    }
}

#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: DashMap<Uuid, DeadLetterEntry>,
    /// job id -> entry id
    by_job: DashMap<Uuid, Uuid>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn insert(&self, entry: &DeadLetterEntry) -> Result<DeadLetterEntry, StoreError> {
        match self.by_job.entry(entry.job_id) {
            Entry::Occupied(existing) => self
                .entries
                .get(existing.get())
                .map(|e| e.value().clone())
                .ok_or_else(|| StoreError::NotFound(format!("dead letter {}", existing.get()))),
            Entry::Vacant(slot) => {
                self.entries.insert(entry.id, entry.clone());
                slot.insert(entry.id);
                Ok(entry.clone())
            }
        }
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        if let Some((_, entry)) = self.entries.remove(&id) {
            self.by_job.remove(&entry.job_id);
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.entries.get(&id).map(|e| e.value().clone()))
    }

    async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut matches: Vec<DeadLetterEntry> = self
            .entries
            .iter()
            .filter(|e| filter.endpoint_id.map_or(true, |id| e.endpoint_id == id))
            .filter(|e| {
                filter
                    .event_type
                    .as_deref()
                    .map_or(true, |t| e.event_type == t)
            })
            .filter(|e| filter.replayed.map_or(true, |r| e.retried_at.is_some() == r))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matches
            .into_iter()
            .skip(filter.offset)
            .take(page_size(filter.limit))
            .collect())
    }

    async fn count(&self, replayed: Option<bool>) -> Result<u64, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| replayed.map_or(true, |r| e.retried_at.is_some() == r))
            .count() as u64)
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        retry_delivery_id: Uuid,
        retried_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut entry) = self.entries.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("dead letter {id}")));
        };
        if entry.retried_at.is_some() {
            return Ok(false);
        }
        entry.retried_at = Some(retried_at);
        entry.retry_delivery_id = Some(retry_delivery_id);
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryEventLogStore {
    entries: DashMap<Uuid, EventLogEntry>,
}

impl MemoryEventLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLogStore for MemoryEventLogStore {
    async fn record(&self, entry: &EventLogEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn complete(
        &self,
        id: Uuid,
        endpoint_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("event log {id}")))?;
        entry.endpoint_count = endpoint_count;
        entry.processed_at = Some(processed_at);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<EventLogEntry>, StoreError> {
        Ok(self.entries.get(&id).map(|e| e.value().clone()))
    }
}
