// Infrastructure layer (shared components)
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod metrics;

// Domain layer
pub mod delivery;
pub mod dispatcher;
pub mod registry;
pub mod scheduler;
pub mod signature;
pub mod worker;

// Application layer
pub mod api;
pub mod server;

// Supporting modules
pub mod shutdown;
pub mod telemetry;
