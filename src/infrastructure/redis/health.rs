//! Connection status of the scheduler's Redis backend, as last observed by
//! the pool.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::BackendMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RedisHealthStatus {
    /// No connection attempted yet
    Idle,
    Connected,
    Disconnected,
    /// Calls are being refused by the circuit breaker
    CircuitOpen,
}

impl RedisHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisHealthStatus::Idle => "idle",
            RedisHealthStatus::Connected => "connected",
            RedisHealthStatus::Disconnected => "disconnected",
            RedisHealthStatus::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedisHealthStats {
    pub status: RedisHealthStatus,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Failed connects since the last successful one
    pub failed_connects: u32,
    /// Successful connects after the first
    pub reconnects: u32,
}

pub struct RedisHealth {
    stats: RwLock<RedisHealthStats>,
}

impl RedisHealth {
    pub fn new() -> Self {
        Self {
            stats: RwLock::new(RedisHealthStats {
                status: RedisHealthStatus::Idle,
                last_connected_at: None,
                last_error: None,
                failed_connects: 0,
                reconnects: 0,
            }),
        }
    }

    fn update(&self, f: impl FnOnce(&mut RedisHealthStats)) {
        let mut stats = self.stats.write().unwrap_or_else(|p| p.into_inner());
        f(&mut stats);
        BackendMetrics::set_redis_connected(stats.status == RedisHealthStatus::Connected);
    }

    pub fn mark_connected(&self) {
        self.update(|s| {
            if s.last_connected_at.is_some() {
                s.reconnects += 1;
            }
            s.status = RedisHealthStatus::Connected;
            s.last_connected_at = Some(Utc::now());
            s.failed_connects = 0;
        });
    }

    /// A connect failed, or the cached connection was dropped.
    pub fn mark_disconnected(&self, error: &str) {
        self.update(|s| {
            if s.status != RedisHealthStatus::Connected {
                s.failed_connects += 1;
            }
            s.status = RedisHealthStatus::Disconnected;
            s.last_error = Some(error.to_string());
        });
    }

    pub fn mark_circuit_open(&self) {
        self.update(|s| s.status = RedisHealthStatus::CircuitOpen);
    }

    pub fn status(&self) -> RedisHealthStatus {
        self.stats().status
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == RedisHealthStatus::Connected
    }

    pub fn stats(&self) -> RedisHealthStats {
        self.stats.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for RedisHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_idle() {
        let health = RedisHealth::new();
        assert_eq!(health.status(), RedisHealthStatus::Idle);
        assert!(!health.is_healthy());
        assert!(health.stats().last_connected_at.is_none());
    }

    #[test]
    fn test_reconnect_counting() {
        let health = RedisHealth::new();
        health.mark_disconnected("refused");
        health.mark_disconnected("refused");
        assert_eq!(health.stats().failed_connects, 2);

        health.mark_connected();
        let stats = health.stats();
        assert!(health.is_healthy());
        assert_eq!(stats.failed_connects, 0);
        assert_eq!(stats.reconnects, 0);
        assert_eq!(stats.last_error.as_deref(), Some("refused"));

        health.mark_disconnected("connection reset");
        health.mark_connected();
        assert_eq!(health.stats().reconnects, 1);
    }

    #[test]
    fn test_circuit_open_is_unhealthy() {
        let health = RedisHealth::new();
        health.mark_connected();
        health.mark_circuit_open();

        assert_eq!(health.status().as_str(), "circuit_open");
        assert!(!health.is_healthy());
    }
}
