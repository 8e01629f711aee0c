//! Event entry point: fan-out of triggered events into deliveries, the
//! in-process event bus, and manual recovery of failed deliveries.

mod bus;
mod event_dispatcher;
mod recovery;

use thiserror::Error;
use uuid::Uuid;

use crate::delivery::StoreError;
use crate::registry::RegistryError;
use crate::scheduler::SchedulerError;

pub use bus::{EventBus, EventHandler, PublishReport};
pub use event_dispatcher::{DomainEvent, EventDispatcher, TriggerResult};
pub use recovery::RecoveryService;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid event: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("Delivery not found: {0}")]
    DeliveryNotFound(Uuid),

    #[error("Dead letter entry not found: {0}")]
    DeadLetterNotFound(Uuid),

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(Uuid),

    #[error("Delivery {0} was already delivered")]
    AlreadyDelivered(Uuid),

    #[error("Delivery {0} has an attempt in flight")]
    AttemptInFlight(Uuid),

    #[error("Dead letter entry {0} was already replayed")]
    AlreadyReplayed(Uuid),

    #[error("Endpoint {0} is inactive")]
    EndpointInactive(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}
