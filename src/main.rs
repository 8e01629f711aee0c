use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use webhook_delivery_service::config::Settings;
use webhook_delivery_service::delivery::create_stores;
use webhook_delivery_service::infrastructure::postgres::PostgresPool;
use webhook_delivery_service::infrastructure::redis::{RedisHealth, RedisPool};
use webhook_delivery_service::infrastructure::CircuitBreaker;
use webhook_delivery_service::registry::create_endpoint_registry;
use webhook_delivery_service::scheduler::create_job_scheduler;
use webhook_delivery_service::server::{create_app, AppState};
use webhook_delivery_service::shutdown::{GracefulShutdown, ShutdownConfig};
use webhook_delivery_service::telemetry::init_telemetry;
use webhook_delivery_service::worker::{DeliveryWorker, WebhookClient, WorkerPool};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (kept alive until exit so spans get flushed)
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Backends
    let postgres_pool = connect_postgres(&settings).await;
    let redis_pool = connect_redis(&settings);

    let endpoints = create_endpoint_registry(&settings.registry, postgres_pool.clone());
    let stores = create_stores(&settings.store, postgres_pool.clone());
    let scheduler = create_job_scheduler(&settings.scheduler, redis_pool.clone());

    // Delivery workers
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let client = WebhookClient::new(&settings.delivery)?;
    let worker = Arc::new(DeliveryWorker::new(
        stores.clone(),
        scheduler.clone(),
        client,
        std::time::Duration::from_secs(settings.delivery.claim_lease_seconds),
    ));
    let pool = WorkerPool::new(
        worker,
        scheduler.clone(),
        &settings.delivery,
        shutdown_tx.subscribe(),
    );
    let mut shutdown = GracefulShutdown::new(shutdown_tx.clone())
        .with_config(ShutdownConfig::for_delivery(&settings.delivery))
        .with_postgres_pool(postgres_pool.clone());
    shutdown.track_worker(tokio::spawn(pool.run()));

    // Create application state
    let addr = settings.server_addr();
    let state = AppState::new(
        settings,
        endpoints,
        stores,
        scheduler,
        redis_pool,
        postgres_pool,
    );
    tracing::info!("Application state initialized");

    // Create Axum app
    let app = create_app(state);

    // Start server
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown_tx.subscribe()))
        .await?;

    let result = shutdown.execute("server stopped").await;
    if !result.success {
        tracing::warn!(
            workers_aborted = result.workers_aborted,
            "Some deliveries were interrupted; their jobs will be redelivered"
        );
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn connect_postgres(settings: &Settings) -> Option<Arc<PostgresPool>> {
    let config = settings.database.as_ref()?;
    let circuit_breaker = Arc::new(CircuitBreaker::new("postgres"));

    match PostgresPool::new(config, circuit_breaker).await {
        Ok(pool) => {
            tracing::info!(url = %pool.database_url_masked(), "PostgreSQL connected");
            Some(Arc::new(pool))
        }
        Err(e) => {
            tracing::error!(error = %e, "PostgreSQL unavailable, persistent backends disabled");
            None
        }
    }
}

fn connect_redis(settings: &Settings) -> Option<Arc<RedisPool>> {
    if settings.scheduler.backend != "redis" {
        return None;
    }

    let circuit_breaker = Arc::new(CircuitBreaker::new("redis"));
    let health = Arc::new(RedisHealth::new());
    match RedisPool::new(&settings.redis, circuit_breaker, health) {
        Ok(pool) => {
            tracing::info!("Redis pool created for job scheduler");
            Some(Arc::new(pool))
        }
        Err(e) => {
            tracing::error!(error = %e, "Invalid Redis configuration");
            None
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM, or when shutdown was already signaled.
async fn shutdown_signal_handler(mut shutdown_rx: broadcast::Receiver<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
        _ = shutdown_rx.recv() => {}
    }
}
