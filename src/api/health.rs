//! Health check and statistics endpoints.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::delivery::DeliveryStats;
use crate::infrastructure::{CircuitBreakerStats, CircuitState};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub scheduler: BackendHealth,
    pub store: BackendHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisHealthResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresHealthResponse>,
}

#[derive(Debug, Serialize)]
pub struct BackendHealth {
    pub backend: String,
}

#[derive(Debug, Serialize)]
pub struct RedisHealthResponse {
    pub status: String,
    pub connected: bool,
    pub circuit: CircuitState,
}

#[derive(Debug, Serialize)]
pub struct PostgresHealthResponse {
    pub connected: bool,
    pub pool_size: u32,
    pub idle_connections: u32,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub deliveries: DeliveryStats,
    pub dead_letters: DeadLetterStats,
    pub scheduler: SchedulerStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisStats>,
}

#[derive(Debug, Serialize)]
pub struct DeadLetterStats {
    pub total: u64,
    pub awaiting_replay: u64,
}

#[derive(Debug, Serialize)]
pub struct SchedulerStats {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_jobs: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RedisStats {
    pub status: String,
    pub circuit_breaker: CircuitBreakerStats,
    pub failed_connects: u32,
    pub reconnects: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// GET /health
///
/// 503 when a configured Redis or PostgreSQL backend is unreachable.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let redis = match &state.redis_pool {
        Some(pool) => {
            let connected = pool.ping().await.is_ok();
            Some(RedisHealthResponse {
                status: pool.health().status().as_str().to_string(),
                connected,
                circuit: pool.circuit_state(),
            })
        }
        None => None,
    };

    let postgres = match &state.postgres_pool {
        Some(pool) => {
            let inner = pool.pool();
            Some(PostgresHealthResponse {
                connected: pool.ping().await.is_ok(),
                pool_size: inner.size(),
                idle_connections: inner.num_idle() as u32,
            })
        }
        None => None,
    };

    let healthy = redis.as_ref().map_or(true, |r| r.connected)
        && postgres.as_ref().map_or(true, |p| p.connected);
    let (code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            scheduler: BackendHealth {
                backend: state.scheduler.backend_type().to_string(),
            },
            store: BackendHealth {
                backend: state.stores.backend_type().to_string(),
            },
            redis,
            postgres,
        }),
    )
}

/// GET /stats
pub async fn stats(State(state): State<AppState>) -> crate::error::Result<Json<StatsResponse>> {
    let deliveries = state.stores.deliveries.stats(None).await?;
    let total = state.stores.dead_letters.count(None).await?;
    let awaiting_replay = state.stores.dead_letters.count(Some(false)).await?;

    let pending_jobs = match state.scheduler.pending().await {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read scheduler backlog");
            None
        }
    };

    let redis = state.redis_pool.as_ref().map(|pool| {
        let health = pool.health().stats();
        RedisStats {
            status: health.status.as_str().to_string(),
            circuit_breaker: pool.circuit_breaker_stats(),
            failed_connects: health.failed_connects,
            reconnects: health.reconnects,
            last_error: health.last_error,
        }
    });

    Ok(Json(StatsResponse {
        deliveries,
        dead_letters: DeadLetterStats {
            total,
            awaiting_replay,
        },
        scheduler: SchedulerStats {
            backend: state.scheduler.backend_type().to_string(),
            pending_jobs,
        },
        redis,
    }))
}
