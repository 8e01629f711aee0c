use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
    /// Apply the bundled SQL migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Outbound delivery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum number of attempts processed concurrently
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// How often the poller asks the scheduler for due jobs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Hard timeout on the outbound POST
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Characters of the subscriber response kept on the delivery record
    #[serde(default = "default_response_body_limit")]
    pub response_body_limit: usize,
    /// Product name used in the `User-Agent` header (`<product>-Webhook/1.0`)
    #[serde(default = "default_user_agent_product")]
    pub user_agent_product: String,
    /// How long a worker owns a delivery once it has claimed it
    #[serde(default = "default_claim_lease")]
    pub claim_lease_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// `memory` or `redis`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
    #[serde(default = "default_scheduler_prefix")]
    pub redis_prefix: String,
    /// Claimed but unacknowledged jobs become visible again after this long
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// `memory` or `postgres`
    #[serde(default = "default_memory_backend")]
    pub backend: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
    /// Emit logs as JSON lines instead of human-readable text
    #[serde(default)]
    pub json_logs: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    600
}

fn default_true() -> bool {
    true
}

fn default_worker_count() -> usize {
    16
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_batch_size() -> usize {
    32
}

fn default_request_timeout() -> u64 {
    30
}

fn default_response_body_limit() -> usize {
    1000
}

fn default_user_agent_product() -> String {
    "Ara".to_string()
}

fn default_claim_lease() -> u64 {
    90
}

fn default_memory_backend() -> String {
    "memory".to_string()
}

fn default_scheduler_prefix() -> String {
    "webhook:jobs".to_string()
}

fn default_visibility_timeout() -> u64 {
    120
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "webhook-delivery-service".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8081)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("delivery.request_timeout_seconds", 30)?
            .set_default("delivery.response_body_limit", 1000)?
            .set_default("scheduler.backend", "memory")?
            .set_default("store.backend", "memory")?
            .set_default("registry.backend", "memory")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // DELIVERY__REQUEST_TIMEOUT_SECONDS, SCHEDULER__BACKEND, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            // Conventional single-name variables
            .set_override_option("database.url", env::var("DATABASE_URL").ok())?
            .set_override_option("redis.url", env::var("REDIS_URL").ok())?
            .set_override_option("api.key", env::var("API_KEY").ok())?;

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            api: ApiConfig::default(),
            redis: RedisConfig::default(),
            database: None,
            delivery: DeliveryConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            registry: RegistryConfig::default(),
            otel: OtelConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            request_timeout_seconds: default_request_timeout(),
            response_body_limit: default_response_body_limit(),
            user_agent_product: default_user_agent_product(),
            claim_lease_seconds: default_claim_lease(),
        }
    }
}

impl DeliveryConfig {
    pub fn user_agent(&self) -> String {
        format!("{}-Webhook/1.0", self.user_agent_product)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
            redis_prefix: default_scheduler_prefix(),
            visibility_timeout_seconds: default_visibility_timeout(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: default_memory_backend(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
            json_logs: false,
        }
    }
}
