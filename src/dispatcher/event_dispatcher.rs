use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::delivery::{AttemptRecord, Delivery, EventLogEntry, Stores};
use crate::metrics::{DeliveryMetrics, EventMetrics};
use crate::registry::{is_known_event_type, Endpoint, EndpointRegistry};
use crate::scheduler::{submit_with_retry, DeliveryJob, JobScheduler};

use super::DispatchError;

/// A domain event as emitted by a business service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    /// Generated when absent
    #[serde(default)]
    pub event_id: Option<String>,
    pub payload: Value,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub triggered_by: Option<String>,
}

fn default_source() -> String {
    "api".to_string()
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: None,
            payload,
            source: default_source(),
            triggered_by: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerResult {
    pub event_log_id: Uuid,
    pub event_id: String,
    pub event_type: String,
    /// Endpoints whose first attempt is scheduled
    pub endpoint_count: u32,
    pub delivery_ids: Vec<Uuid>,
    /// Endpoints whose delivery could not be created or scheduled
    pub failed_endpoints: Vec<Uuid>,
}

enum FanOut {
    Scheduled(Uuid),
    Failed(Uuid),
}

pub struct EventDispatcher {
    registry: Arc<dyn EndpointRegistry>,
    stores: Stores,
    scheduler: Arc<dyn JobScheduler>,
}

impl EventDispatcher {
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

    /// Log the event and schedule one delivery per active subscriber.
    ///
    /// A failure for one endpoint never affects the others. No subscriber
    /// at all is not an error.
    #[tracing::instrument(
        name = "event.trigger",
        skip(self, event),
        fields(event_type = %event.event_type, source = %event.source)
    )]
    pub async fn trigger(&self, event: DomainEvent) -> Result<TriggerResult, DispatchError> {
        if event.event_type.trim().is_empty() {
            return Err(DispatchError::Validation("event_type is required".to_string()));
        }
        if !is_known_event_type(&event.event_type) {
            return Err(DispatchError::Validation(format!(
                "unknown event type '{}'",
                event.event_type
            )));
        }

        let event_id = event
            .event_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("evt_{}", Uuid::new_v4().simple()));

        let log = EventLogEntry::new(
            &event.event_type,
            &event_id,
            event.payload.clone(),
            &event.source,
            event.triggered_by.clone(),
        );
        self.stores.events.record(&log).await?;

        let endpoints = self
            .registry
            .find_active_endpoints_subscribed_to(&event.event_type)
            .await?;

        if endpoints.is_empty() {
            self.stores.events.complete(log.id, 0, Utc::now()).await?;
            EventMetrics::record_triggered(&event.event_type, 0);
            tracing::info!(%event_id, "No active endpoints subscribed");
            return Ok(TriggerResult {
                event_log_id: log.id,
                event_id,
                event_type: event.event_type,
                endpoint_count: 0,
                delivery_ids: Vec::new(),
                failed_endpoints: Vec::new(),
            });
        }

        let results = join_all(
            endpoints
                .iter()
                .map(|endpoint| self.fan_out_one(endpoint, &event, &event_id)),
        )
        .await;

        let mut delivery_ids = Vec::with_capacity(results.len());
        let mut failed_endpoints = Vec::new();
        for result in results {
            match result {
                FanOut::Scheduled(delivery_id) => delivery_ids.push(delivery_id),
                FanOut::Failed(endpoint_id) => failed_endpoints.push(endpoint_id),
            }
        }

        let endpoint_count = delivery_ids.len() as u32;
        self.stores
            .events
            .complete(log.id, endpoint_count, Utc::now())
            .await?;
        EventMetrics::record_triggered(&event.event_type, delivery_ids.len());

        tracing::info!(
            %event_id,
            endpoint_count,
            failed = failed_endpoints.len(),
            "Event fanned out"
        );

        Ok(TriggerResult {
            event_log_id: log.id,
            event_id,
            event_type: event.event_type,
            endpoint_count,
            delivery_ids,
            failed_endpoints,
        })
    }

    async fn fan_out_one(
        &self,
        endpoint: &Endpoint,
        event: &DomainEvent,
        event_id: &str,
    ) -> FanOut {
        let delivery = Delivery::new(
            endpoint.id,
            &event.event_type,
            event_id,
            event.payload.clone(),
        );

        if let Err(e) = self.stores.deliveries.create(&delivery).await {
            EventMetrics::record_fanout_failure();
            tracing::error!(
                endpoint_id = %endpoint.id,
                error = %e,
                "Failed to create delivery record"
            );
            return FanOut::Failed(endpoint.id);
        }
        DeliveryMetrics::record_created();

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

        match submit_with_retry(self.scheduler.as_ref(), &job, Duration::ZERO).await {
            Ok(_) => FanOut::Scheduled(delivery.id),
            Err(e) => {
                EventMetrics::record_fanout_failure();
                let record = AttemptRecord {
                    error: Some(format!("scheduling failed: {e}")),
                    ..Default::default()
                };
                if let Err(e) = self
                    .stores
                    .fail_and_dead_letter(delivery.id, delivery.job_id, 0, &record, &endpoint.url)
                    .await
                {
                    tracing::error!(
                        delivery_id = %delivery.id,
                        error = %e,
                        "Failed to dead-letter unschedulable delivery"
                    );
                }
                FanOut::Failed(endpoint.id)
            }
        }
    }
}
