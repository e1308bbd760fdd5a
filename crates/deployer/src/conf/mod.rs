//! Configuration — immutable snapshot loaded once at startup.
//!
//! Field groups live in [`model`]; the env-file / environment loader and
//! validation live in [`load`].

pub mod load;
pub mod model;

pub use load::ConfigError;
pub use model::{
    AdminConfig, DeployerConfig, LifetimeConfig, LimitsConfig, LoggingConfig, MaintenanceConfig,
    NetworkConfig, PortsConfig, QuotaConfig, RateLimitConfig, SecurityConfig, StoreConfig,
};
