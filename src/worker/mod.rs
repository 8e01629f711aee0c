//! Delivery workers: claim a job, POST the signed payload, then record the
//! outcome, schedule the next attempt or dead-letter the delivery.

mod client;
mod pool;
mod processor;

pub use client::{AttemptError, AttemptOutcome, WebhookClient};
pub use pool::WorkerPool;
pub use processor::{DeliveryWorker, ProcessOutcome};
