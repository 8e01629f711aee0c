//! Graceful shutdown for the delivery service.
//!
//! Shutdown runs in phases:
//! 1. Signal background tasks (worker pools) over the broadcast channel
//! 2. Wait for in-flight deliveries to finish, aborting stragglers
//! 3. Close the PostgreSQL pool
//!
//! Jobs that were claimed but never acknowledged stay in the scheduler and
//! are handed out again after the visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::DeliveryConfig;
use crate::infrastructure::postgres::PostgresPool;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for worker pools to drain (default: 45 seconds)
    pub worker_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            worker_timeout: Duration::from_secs(45),
        }
    }
}

impl ShutdownConfig {
    /// Leave room for a request that started just before the signal.
    pub fn for_delivery(config: &DeliveryConfig) -> Self {
        Self {
            worker_timeout: Duration::from_secs(config.request_timeout_seconds + 15),
        }
    }
}

pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    workers: Vec<JoinHandle<()>>,
    postgres_pool: Option<Arc<PostgresPool>>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            shutdown_tx,
            workers: Vec::new(),
            postgres_pool: None,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ShutdownConfig) -> Self {
        self.config = config;
        self
    }

    /// Track a background task that exits once the shutdown signal is sent.
    pub fn track_worker(&mut self, handle: JoinHandle<()>) {
        self.workers.push(handle);
    }

    pub fn with_postgres_pool(mut self, pool: Option<Arc<PostgresPool>>) -> Self {
        self.postgres_pool = pool;
        self
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(workers = self.workers.len())
    )]
    pub async fn execute(self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Signaling workers");
        // No receivers left just means every worker already exited
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Waiting for in-flight deliveries");
        let (stopped, aborted) =
            Self::wait_for_workers(self.workers, self.config.worker_timeout).await;
        result.workers_stopped = stopped;
        result.workers_aborted = aborted;

        tracing::info!("Phase 3: Closing connection pools");
        if let Some(pool) = &self.postgres_pool {
            pool.close().await;
            result.pools_closed += 1;
        }

        result.duration = start.elapsed();
        result.success = aborted == 0;

        tracing::info!(
            workers_stopped = result.workers_stopped,
            workers_aborted = result.workers_aborted,
            pools_closed = result.pools_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    async fn wait_for_workers(workers: Vec<JoinHandle<()>>, limit: Duration) -> (usize, usize) {
        let mut stopped = 0;
        let mut aborted = 0;
        let deadline = tokio::time::Instant::now() + limit;

        for mut handle in workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, &mut handle).await {
                Ok(Ok(())) => stopped += 1,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Worker task ended abnormally");
                    stopped += 1;
                }
                Err(_) => {
                    tracing::warn!("Worker did not stop in time, aborting");
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        (stopped, aborted)
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// True when every worker stopped on its own
    pub success: bool,
    pub workers_stopped: usize,
    pub workers_aborted: usize,
    pub pools_closed: usize,
    pub duration: Duration,
}
