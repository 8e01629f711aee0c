//! Redis connection management for the job scheduler.
//!
//! - `RedisPool`: shared multiplexed connection guarded by a circuit breaker
//! - `RedisHealth`: connection health tracking for `/health`

mod health;
pub mod pool;

pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::{PoolError, RedisPool};
