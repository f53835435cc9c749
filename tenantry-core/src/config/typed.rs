use super::{ConfigError, TenantryConfig};

/// A strongly-typed configuration section read from a [`TenantryConfig`].
///
/// ```ignore
/// pub struct PoolSettings { pub size: u32 }
///
/// impl ConfigSection for PoolSettings {
///     fn prefix() -> &'static str { "data.pool" }
///     fn from_config(config: &TenantryConfig) -> Result<Self, ConfigError> {
///         Ok(Self { size: config.get_or("data.pool.size", 5)? })
///     }
/// }
/// ```
pub trait ConfigSection: Sized {
    /// Key prefix of the section (e.g. `"data"`).
    fn prefix() -> &'static str;

    fn from_config(config: &TenantryConfig) -> Result<Self, ConfigError>;
}
