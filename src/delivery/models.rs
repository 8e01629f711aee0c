use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::retry_policy::MAX_ATTEMPTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Retrying,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Retrying => "retrying",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Statuses a worker may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, DeliveryStatus::Pending | DeliveryStatus::Retrying)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "retrying" => Ok(DeliveryStatus::Retrying),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status '{other}'")),
        }
    }
}

/// One event delivered to one endpoint, with its attempt history.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub event_type: String,
    pub event_id: String,
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub last_response_body: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Job currently allowed to work on this delivery
    #[serde(skip_serializing)]
    pub job_id: Uuid,
    /// Lease held by the worker processing `job_id`
    #[serde(skip_serializing)]
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    pub fn new(endpoint_id: Uuid, event_type: &str, event_id: &str, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            endpoint_id,
            event_type: event_type.to_string(),
            event_id: event_id.to_string(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            last_status_code: None,
            last_error: None,
            last_response_body: None,
            next_retry_at: None,
            delivered_at: None,
            failed_at: None,
            job_id: Uuid::new_v4(),
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of one HTTP attempt, as recorded on the delivery.
#[derive(Debug, Clone, Default)]
pub struct AttemptRecord {
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub response_body: Option<String>,
}

/// Outcome of trying to claim a delivery for a job.
#[derive(Debug, Clone)]
pub enum ClaimResult {
    /// The caller now holds the lease
    Claimed(Delivery),
    /// Another worker holds an unexpired lease for the same job
    Busy,
    /// The job is superseded, the delivery is terminal, or it no longer exists
    Stale,
}

/// Outcome of resetting a delivery for a manual retry.
#[derive(Debug, Clone)]
pub enum ResetResult {
    Reset(Delivery),
    /// A worker holds an unexpired lease; its attempt may still be in flight
    InFlight,
    /// Already delivered, or missing
    Finished,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryFilter {
    pub endpoint_id: Option<Uuid>,
    pub status: Option<DeliveryStatus>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub total: u64,
    pub pending: u64,
    pub retrying: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryStats {
    pub(crate) fn add(&mut self, status: DeliveryStatus, count: u64) {
        self.total += count;
        match status {
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Retrying => self.retrying += count,
            DeliveryStatus::Delivered => self.delivered += count,
            DeliveryStatus::Failed => self.failed += count,
        }
    }
}

/// Immutable log of a triggered event.
#[derive(Debug, Clone, Serialize)]
pub struct EventLogEntry {
    pub id: Uuid,
    pub event_type: String,
    pub event_id: String,
    pub payload: Value,
    pub source: String,
    pub triggered_by: Option<String>,
    pub endpoint_count: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EventLogEntry {
    pub fn new(
        event_type: &str,
        event_id: &str,
        payload: Value,
        source: &str,
        triggered_by: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.to_string(),
            event_id: event_id.to_string(),
            payload,
            source: source.to_string(),
            triggered_by,
            endpoint_count: 0,
            processed_at: None,
            created_at: Utc::now(),
        }
    }
}

/// A delivery that exhausted its attempts (or could not be scheduled).
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub delivery_id: Uuid,
    /// Job whose failure produced the entry. At most one entry per job.
    pub job_id: Uuid,
    pub endpoint_id: Uuid,
    pub endpoint_url: String,
    pub event_type: String,
    pub event_id: String,
    pub payload: Value,
    pub error_message: String,
    pub status_code: Option<u16>,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub retried_at: Option<DateTime<Utc>>,
    pub retry_delivery_id: Option<Uuid>,
}

impl DeadLetterEntry {
    pub fn from_delivery(delivery: &Delivery, endpoint_url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            delivery_id: delivery.id,
            job_id: delivery.job_id,
            endpoint_id: delivery.endpoint_id,
            endpoint_url: endpoint_url.to_string(),
            event_type: delivery.event_type.clone(),
            event_id: delivery.event_id.clone(),
            payload: delivery.payload.clone(),
            error_message: delivery
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
            status_code: delivery.last_status_code,
            attempts_made: delivery.attempts,
            created_at: Utc::now(),
            retried_at: None,
            retry_delivery_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetterFilter {
    pub endpoint_id: Option<Uuid>,
    pub event_type: Option<String>,
    /// `Some(true)` only replayed entries, `Some(false)` only unreplayed
    pub replayed: Option<bool>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for DeliveryFilter {
    fn default() -> Self {
        Self {
            endpoint_id: None,
            status: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl Default for DeadLetterFilter {
    fn default() -> Self {
        Self {
            endpoint_id: None,
            event_type: None,
            replayed: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

pub const MAX_PAGE_SIZE: usize = 200;

fn default_limit() -> usize {
    50
}

/// Clamp a requested page size to `1..=MAX_PAGE_SIZE`.
pub(crate) fn page_size(limit: usize) -> usize {
    limit.clamp(1, MAX_PAGE_SIZE)
}
