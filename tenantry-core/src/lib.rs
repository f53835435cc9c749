//! Ambient runtime support shared by the tenantry crates: layered
//! configuration and tracing initialisation.

pub mod config;
pub mod logging;

pub use config::{
    ConfigError, ConfigSection, ConfigValue, DefaultSecretResolver, FromConfigValue,
    SecretResolver, TenantryConfig,
};
pub use logging::{init_tracing, init_tracing_with, LogFormat};
