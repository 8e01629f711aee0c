use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::delivery::Stores;
use crate::dispatcher::{EventBus, EventDispatcher, RecoveryService};
use crate::infrastructure::postgres::PostgresPool;
use crate::infrastructure::redis::RedisPool;
use crate::registry::Endpoints;
use crate::scheduler::{JobScheduler, MemoryJobScheduler};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub endpoints: Endpoints,
    pub stores: Stores,
    pub scheduler: Arc<dyn JobScheduler>,
    pub recovery: Arc<RecoveryService>,
    pub event_bus: Arc<EventBus>,
    pub redis_pool: Option<Arc<RedisPool>>,
    pub postgres_pool: Option<Arc<PostgresPool>>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        endpoints: Endpoints,
        stores: Stores,
        scheduler: Arc<dyn JobScheduler>,
        redis_pool: Option<Arc<RedisPool>>,
        postgres_pool: Option<Arc<PostgresPool>>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new(
            endpoints.registry.clone(),
            stores.clone(),
            scheduler.clone(),
        ));
        let recovery = Arc::new(RecoveryService::new(
            endpoints.registry.clone(),
            stores.clone(),
            scheduler.clone(),
        ));
        let event_bus = Arc::new(EventBus::with_dispatcher(dispatcher));

        Self {
            settings: Arc::new(settings),
            endpoints,
            stores,
            scheduler,
            recovery,
            event_bus,
            redis_pool,
            postgres_pool,
            start_time: Instant::now(),
        }
    }

    /// Everything in memory; no Redis or PostgreSQL required.
    pub fn in_memory(settings: Settings) -> Self {
        let visibility =
            std::time::Duration::from_secs(settings.scheduler.visibility_timeout_seconds);
        Self::new(
            settings,
            Endpoints::memory(),
            Stores::memory(),
            Arc::new(MemoryJobScheduler::new(visibility)),
            None,
            None,
        )
    }
}
