//! Redis connection for the job scheduler.
//!
//! A single [`ConnectionManager`] is created on first use and shared by every
//! task; it re-establishes the connection on its own after a drop. Commands go
//! through [`RedisPool::execute`] so the circuit breaker and health tracker
//! see each outcome.

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{Client, RedisError, RedisResult};
use tokio::sync::OnceCell;

use crate::config::RedisConfig;
use crate::infrastructure::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::metrics::BackendMetrics;

use super::RedisHealth;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

pub struct RedisPool {
    client: Client,
    manager: OnceCell<ConnectionManager>,
    circuit_breaker: Arc<CircuitBreaker>,
    health: Arc<RedisHealth>,
}

impl RedisPool {
    /// Validate the URL. No connection is made until the first command.
    pub fn new(
        config: &RedisConfig,
        circuit_breaker: Arc<CircuitBreaker>,
        health: Arc<RedisHealth>,
    ) -> Result<Self, PoolError> {
        Ok(Self {
            client: Client::open(config.url.as_str())?,
            manager: OnceCell::new(),
            circuit_breaker,
            health,
        })
    }

    async fn connection(&self) -> RedisResult<ConnectionManager> {
        let manager = self
            .manager
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                tracing::info!("Redis connection established");
                Ok::<_, RedisError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Run a command with circuit breaker protection.
    pub async fn execute<F, T, Fut>(&self, operation: &'static str, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = RedisResult<T>>,
    {
        if !self.circuit_breaker.allow_request() {
            self.health.mark_circuit_open();
            return Err(PoolError::CircuitOpen);
        }

        let result = match self.connection().await {
            Ok(conn) => f(conn).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                self.circuit_breaker.record_success();
                if !self.health.is_healthy() {
                    self.health.mark_connected();
                }
                Ok(value)
            }
            Err(e) => {
                // Script and type errors are the caller's problem, not Redis being down
                if is_backend_failure(&e) {
                    self.circuit_breaker.record_failure();
                    self.health.mark_disconnected(&e.to_string());
                } else {
                    self.circuit_breaker.record_success();
                }
                BackendMetrics::record_error("redis", operation);
                tracing::warn!(operation, error = %e, "Redis command failed");
                Err(PoolError::Redis(e))
            }
        }
    }

    /// Connected and the breaker is closed.
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy() && self.circuit_breaker.state() == CircuitState::Closed
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn circuit_breaker_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }

    pub fn health(&self) -> &Arc<RedisHealth> {
        &self.health
    }

    pub async fn ping(&self) -> Result<(), PoolError> {
        let _pong: String = self
            .execute("ping", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }
}

fn is_backend_failure(err: &RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::redis::RedisHealthStatus;

    fn config(url: &str) -> RedisConfig {
        RedisConfig {
            url: url.to_string(),
        }
    }

    #[test]
    fn test_invalid_url_rejected() {
        let cb = Arc::new(CircuitBreaker::new("redis"));
        let health = Arc::new(RedisHealth::new());

        assert!(RedisPool::new(&config("not a url"), cb.clone(), health.clone()).is_err());
        assert!(RedisPool::new(&config("redis://localhost:6379"), cb, health).is_ok());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let cb = Arc::new(CircuitBreaker::new("redis"));
        let health = Arc::new(RedisHealth::new());
        let pool = RedisPool::new(&config("redis://localhost:6379"), cb.clone(), health).unwrap();

        for _ in 0..5 {
            cb.record_failure();
        }

        assert_eq!(pool.circuit_state(), CircuitState::Open);
        assert!(!pool.is_healthy());
        assert!(matches!(pool.ping().await, Err(PoolError::CircuitOpen)));
        assert_eq!(pool.health().status(), RedisHealthStatus::CircuitOpen);
    }
}
