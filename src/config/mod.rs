mod settings;

pub use settings::{
    ApiConfig, DatabaseConfig, DeliveryConfig, OtelConfig, RedisConfig, RegistryConfig,
    SchedulerConfig, ServerConfig, Settings, StoreConfig,
};
