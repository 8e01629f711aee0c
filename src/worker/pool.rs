//! Poller that feeds due jobs to a bounded set of delivery tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;

use crate::config::DeliveryConfig;
use crate::infrastructure::ExponentialBackoff;
use crate::metrics::{DeliveryMetrics, SchedulerMetrics};
use crate::scheduler::JobScheduler;

use super::processor::DeliveryWorker;

pub struct WorkerPool {
    worker: Arc<DeliveryWorker>,
    scheduler: Arc<dyn JobScheduler>,
    slots: Arc<Semaphore>,
    worker_count: usize,
    batch_size: usize,
    poll_interval: Duration,
    drain_timeout: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl WorkerPool {
    pub fn new(
        worker: Arc<DeliveryWorker>,
        scheduler: Arc<dyn JobScheduler>,
        config: &DeliveryConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let worker_count = config.worker_count.max(1);
        Self {
            worker,
            scheduler,
            slots: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            batch_size: config.batch_size.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            drain_timeout: Duration::from_secs(config.request_timeout_seconds + 5),
            shutdown,
        }
    }

    /// Poll until shutdown, then wait (bounded) for in-flight attempts.
    pub async fn run(mut self) {
        let mut poll_timer = tokio::time::interval(self.poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = ExponentialBackoff::new();

        tracing::info!(
            worker_count = self.worker_count,
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            scheduler = self.scheduler.backend_type(),
            "Delivery worker pool started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Worker pool received shutdown signal");
                    break;
                }
                _ = poll_timer.tick() => {
                    if let Err(delay) = self.poll_once(&mut backoff).await {
                        tokio::select! {
                            _ = self.shutdown.recv() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.drain().await;
        tracing::info!("Delivery worker pool stopped");
    }

    /// Claim as many due jobs as there are free slots and spawn them.
    /// On scheduler failure returns the delay to back off for.
    async fn poll_once(&self, backoff: &mut ExponentialBackoff) -> Result<usize, Duration> {
        let free = self.slots.available_permits().min(self.batch_size);
        if free == 0 {
            return Ok(0);
        }

        let jobs = match self.scheduler.claim_due(Utc::now(), free).await {
            Ok(jobs) => {
                backoff.reset();
                jobs
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to claim due jobs"
                );
                return Err(delay);
            }
        };

        let claimed = jobs.len();
        if claimed > 0 {
            SchedulerMetrics::record_claimed(claimed);
        }

        for job in jobs {
            let Ok(permit) = self.slots.clone().acquire_owned().await else {
                break;
            };
            let worker = self.worker.clone();
            tokio::spawn(async move {
                DeliveryMetrics::worker_started();
                worker.handle(job).await;
                DeliveryMetrics::worker_finished();
                drop(permit);
            });
        }

        Ok(claimed)
    }

    async fn drain(&self) {
        let in_flight = self.worker_count - self.slots.available_permits();
        if in_flight == 0 {
            return;
        }

        tracing::info!(in_flight, "Waiting for in-flight deliveries");
        let all = self.slots.acquire_many(self.worker_count as u32);
        match timeout(self.drain_timeout, all).await {
            Ok(_) => tracing::info!("In-flight deliveries finished"),
            Err(_) => tracing::warn!(
                remaining = self.worker_count - self.slots.available_permits(),
                "Drain timeout, unacknowledged jobs will be redelivered"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Stores;
    use crate::scheduler::MemoryJobScheduler;
    use crate::worker::WebhookClient;

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let scheduler: Arc<dyn JobScheduler> =
            Arc::new(MemoryJobScheduler::new(Duration::from_secs(60)));
        let config = DeliveryConfig::default();
        let worker = Arc::new(DeliveryWorker::new(
            Stores::memory(),
            scheduler.clone(),
            WebhookClient::new(&config).unwrap(),
            Duration::from_secs(90),
        ));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(WorkerPool::new(worker, scheduler, &config, rx).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();

        timeout(Duration::from_secs(2), handle)
            .await
            .expect("pool did not stop")
            .unwrap();
    }
}
