//! In-process event bus: a plain map from event type to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::KNOWN_EVENT_TYPES;

use super::event_dispatcher::{DomainEvent, EventDispatcher, TriggerResult};
use super::DispatchError;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handlers that fan the event out to webhooks return what they
    /// scheduled.
    async fn handle(&self, event: &DomainEvent) -> Result<Option<TriggerResult>, DispatchError>;

    fn name(&self) -> &'static str;
}

#[async_trait]
impl EventHandler for EventDispatcher {
    async fn handle(&self, event: &DomainEvent) -> Result<Option<TriggerResult>, DispatchError> {
        self.trigger(event.clone()).await.map(Some)
    }

    fn name(&self) -> &'static str {
        "webhook_dispatcher"
    }
}

#[derive(Debug, Default)]
pub struct PublishReport {
    pub handled: usize,
    pub failed: usize,
    pub fan_outs: Vec<TriggerResult>,
    pub errors: Vec<DispatchError>,
}

impl PublishReport {
    /// No handler was registered for the event type.
    pub fn is_unrouted(&self) -> bool {
        self.handled == 0 && self.failed == 0
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus with the webhook dispatcher subscribed to every known event type.
    pub fn with_dispatcher(dispatcher: Arc<EventDispatcher>) -> Self {
        let mut bus = Self::new();
        for (event_type, _) in KNOWN_EVENT_TYPES {
            bus.subscribe(event_type, dispatcher.clone());
        }
        bus
    }

    pub fn subscribe(&mut self, event_type: &str, handler: Arc<dyn EventHandler>) {
        self.handlers
            .entry(event_type.to_string())
            .or_default()
            .push(handler);
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map_or(0, Vec::len)
    }

    /// Run every handler registered for the event's type. A failing handler
    /// is logged and does not stop the others.
    pub async fn publish(&self, event: &DomainEvent) -> PublishReport {
        let mut report = PublishReport::default();
        let Some(handlers) = self.handlers.get(&event.event_type) else {
            tracing::debug!(event_type = %event.event_type, "No handlers for event type");
            return report;
        };

        for handler in handlers {
            match handler.handle(event).await {
                Ok(fan_out) => {
                    report.handled += 1;
                    report.fan_outs.extend(fan_out);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        handler = handler.name(),
                        event_type = %event.event_type,
                        error = %e,
                        "Event handler failed"
                    );
                    report.errors.push(e);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use crate::delivery::Stores;
    use crate::registry::{Endpoints, NewEndpoint};
    use crate::scheduler::{JobScheduler, MemoryJobScheduler};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EventHandler for Counting {
        async fn handle(
            &self,
            _event: &DomainEvent,
        ) -> Result<Option<TriggerResult>, DispatchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(
            &self,
            _event: &DomainEvent,
        ) -> Result<Option<TriggerResult>, DispatchError> {
            Err(DispatchError::Validation("nope".to_string()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let mut bus = EventBus::new();
        bus.subscribe("order.created", Arc::new(Failing));
        bus.subscribe("order.created", counting.clone());

        let report = bus
            .publish(&DomainEvent::new("order.created", json!({})))
            .await;

        assert_eq!((report.handled, report.failed), (1, 1));
        assert_eq!(report.errors.len(), 1);
        assert!(report.fan_outs.is_empty());
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        let report = bus
            .publish(&DomainEvent::new("payment.failed", json!({})))
            .await;
        assert!(report.is_unrouted());
    }

    #[tokio::test]
    async fn test_dispatcher_subscribed_to_known_types() {
        let endpoints = Endpoints::memory();
        endpoints
            .admin
            .create(NewEndpoint {
                url: "https://example.com/hook".to_string(),
                events: vec!["payment.succeeded".to_string()],
                owner_id: None,
                metadata: None,
            })
            .await
            .unwrap();

        let scheduler = Arc::new(MemoryJobScheduler::new(Duration::from_secs(60)));
        let dispatcher = Arc::new(EventDispatcher::new(
            endpoints.registry.clone(),
            Stores::memory(),
            scheduler.clone(),
        ));
        let bus = EventBus::with_dispatcher(dispatcher);
        assert_eq!(bus.handler_count("order.created"), 1);
        assert_eq!(bus.handler_count("made.up"), 0);

        let report = bus
            .publish(&DomainEvent::new("payment.succeeded", json!({"amount": 10})))
            .await;
        assert_eq!(report.handled, 1);
        assert_eq!(report.fan_outs.len(), 1);
        assert_eq!(report.fan_outs[0].endpoint_count, 1);
        assert_eq!(scheduler.pending().await.unwrap(), 1);
    }
}
