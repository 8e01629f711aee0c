//! Infrastructure layer modules
//!
//! Shared components used by the persistent backends:
//! - `circuit_breaker`: Fail-fast guard around Redis and PostgreSQL calls
//! - `backoff`: Exponential backoff for reconnects and scheduler re-submission
//! - `postgres`: PostgreSQL connection pool
//! - `redis`: Redis connection pool and health tracking

pub mod backoff;
pub mod circuit_breaker;
pub mod postgres;
pub mod redis;

pub use backoff::{retry_with_backoff, BackoffConfig, ExponentialBackoff};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
