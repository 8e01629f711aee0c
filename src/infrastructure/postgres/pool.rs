//! PostgreSQL pool shared by the delivery, dead-letter, event log and
//! endpoint stores.
//!
//! Every query goes through [`PostgresPool::execute`]. Only connection-level
//! failures count against the circuit breaker; constraint violations and
//! missing rows are ordinary query outcomes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use url::Url;

use crate::config::DatabaseConfig;
use crate::infrastructure::{
    retry_with_backoff, BackoffConfig, CircuitBreaker, CircuitBreakerStats, CircuitState,
};
use crate::metrics::BackendMetrics;

/// Connect attempts at startup before giving up
const CONNECT_TRIES: u32 = 4;

#[derive(Debug, Error)]
pub enum PostgresPoolError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

pub struct PostgresPool {
    pool: PgPool,
    circuit_breaker: Arc<CircuitBreaker>,
    /// Connection URL with the password masked
    display_url: String,
}

impl PostgresPool {
    /// Connect, retrying a few times so the service can start alongside the
    /// database, then apply migrations when configured.
    pub async fn new(
        config: &DatabaseConfig,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, PostgresPoolError> {
        let options = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds as u64))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds as u64));

        let backoff = BackoffConfig {
            initial_delay_ms: 500,
            max_delay_ms: 5_000,
            ..BackoffConfig::default()
        };
        let pool = retry_with_backoff(backoff, CONNECT_TRIES, || {
            options.clone().connect(&config.url)
        })
        .await?;

        let pool = Self {
            pool,
            circuit_breaker,
            display_url: mask_password(&config.url),
        };
        tracing::info!(
            url = %pool.display_url,
            pool_size = config.pool_size,
            "PostgreSQL connection pool created"
        );

        if config.run_migrations {
            pool.migrate().await?;
        }

        Ok(pool)
    }

    pub async fn migrate(&self) -> Result<(), PostgresPoolError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a query with circuit breaker protection.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, PostgresPoolError>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        if !self.circuit_breaker.allow_request() {
            return Err(PostgresPoolError::CircuitOpen);
        }

        let result = f(self.pool.clone()).await;
        match &result {
            Err(e) if is_backend_failure(e) => {
                self.circuit_breaker.record_failure();
                BackendMetrics::record_error("postgres", operation);
                tracing::warn!(operation, error = %e, "PostgreSQL operation failed");
            }
            _ => self.circuit_breaker.record_success(),
        }
        result.map_err(PostgresPoolError::Sqlx)
    }

    /// Connectivity check for `/health`.
    pub async fn ping(&self) -> Result<(), PostgresPoolError> {
        self.execute("ping", |pool| async move {
            sqlx::query("SELECT 1").execute(&pool).await.map(|_| ())
        })
        .await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit_breaker.state()
    }

    pub fn circuit_breaker_stats(&self) -> CircuitBreakerStats {
        self.circuit_breaker.stats()
    }

    pub fn database_url_masked(&self) -> &str {
        &self.display_url
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }
}

/// Whether an error says the database itself is unreachable or unhealthy.
fn is_backend_failure(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn mask_password(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        Ok(url) => url.to_string(),
        // Never echo something we could not parse; it may hold a secret
        Err(_) => "<invalid database url>".to_string(),
    }
}
