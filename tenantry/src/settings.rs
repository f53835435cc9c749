use std::fmt;
use std::time::Duration;

use tenantry_core::{ConfigError, ConfigSection, TenantryConfig};
use tenantry_data::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use tenantry_data::query::is_valid_identifier;

/// Storage engine selected by `data.backend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Sqlite,
}

impl BackendKind {
    /// Registry key of the backend.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Sqlite => "sqlite",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" | "mem" => Some(BackendKind::Memory),
            "sqlite" => Some(BackendKind::Sqlite),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One configured entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntitySettings {
    pub name: String,
    pub physical_name: String,
    pub search_fields: Vec<String>,
}

/// The `data` configuration section.
///
/// ```yaml
/// data:
///   backend: sqlite
///   url: sqlite://tenantry.db
///   pool: 5
///   page:
///     size: 50
///   transaction:
///     timeout: 30000
///   entities: [customer, invoice]
///   search:
///     invoice: [number, customer_name]
///   tables:
///     customer: customers
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DataSettings {
    pub backend: BackendKind,
    pub url: String,
    pub pool: u32,
    pub page_size: u64,
    pub transaction_timeout: Option<Duration>,
    pub entities: Vec<EntitySettings>,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            url: "sqlite::memory:".to_string(),
            pool: 5,
            page_size: DEFAULT_PAGE_SIZE,
            transaction_timeout: None,
            entities: Vec::new(),
        }
    }
}

impl DataSettings {
    pub fn entity(&self, name: &str) -> Option<&EntitySettings> {
        self.entities.iter().find(|e| e.name == name)
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl ConfigSection for DataSettings {
    fn prefix() -> &'static str {
        "data"
    }

    fn from_config(config: &TenantryConfig) -> Result<Self, ConfigError> {
        let defaults = DataSettings::default();

        let backend_name: String = config.get_or("data.backend", defaults.backend.name().to_string())?;
        let backend = BackendKind::parse(&backend_name)
            .ok_or_else(|| invalid("data.backend", format!("unknown backend '{backend_name}'")))?;

        let pool: u32 = config.get_or("data.pool", defaults.pool)?;
        if pool == 0 {
            return Err(invalid("data.pool", "must be at least 1"));
        }

        let page_size: u64 = config.get_or("data.page.size", defaults.page_size)?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(invalid(
                "data.page.size",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }

        let names: Vec<String> = config.get_or("data.entities", Vec::new())?;
        let mut entities: Vec<EntitySettings> = Vec::with_capacity(names.len());
        for name in names {
            if !is_valid_identifier(&name) || name.contains('.') {
                return Err(invalid("data.entities", format!("invalid entity name '{name}'")));
            }
            if entities.iter().any(|e| e.name == name) {
                return Err(invalid("data.entities", format!("entity '{name}' listed twice")));
            }
            let search_fields =
                config.get_or(&format!("data.search.{name}"), vec!["name".to_string()])?;
            let physical_name = config.get_or(&format!("data.tables.{name}"), name.clone())?;
            entities.push(EntitySettings {
                name,
                physical_name,
                search_fields,
            });
        }

        Ok(Self {
            backend,
            url: config.get_or("data.url", defaults.url)?,
            pool,
            page_size,
            transaction_timeout: config.get_or("data.transaction.timeout", None)?,
            entities,
        })
    }
}
