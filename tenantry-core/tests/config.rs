use std::time::Duration;

use serial_test::serial;
use tenantry_core::config::{
    ConfigError, ConfigSection, ConfigValue, DefaultSecretResolver, TenantryConfig,
};

#[test]
fn test_empty_config() {
    let config = TenantryConfig::empty();
    assert!(matches!(
        config.get::<String>("data.url"),
        Err(ConfigError::NotFound(_))
    ));
}

#[test]
fn test_set_and_get() {
    let mut config = TenantryConfig::empty();
    config.set("data.backend", ConfigValue::String("sqlite".into()));
    assert_eq!(config.get::<String>("data.backend").unwrap(), "sqlite");
}

#[test]
fn test_get_or_default_only_when_missing() {
    let mut config = TenantryConfig::empty();
    assert_eq!(config.get_or("data.page.size", 50u64).unwrap(), 50);

    config.set("data.page.size", ConfigValue::String("many".into()));
    assert!(config.get_or("data.page.size", 50u64).is_err());
}

#[test]
fn test_type_conversions() {
    let mut config = TenantryConfig::empty();
    config.set("int_val", ConfigValue::Integer(42));
    config.set("float_val", ConfigValue::Float(2.5));
    config.set("bool_val", ConfigValue::String("yes".into()));
    config.set("null_val", ConfigValue::Null);
    config.set("timeout", ConfigValue::Integer(1500));

    assert_eq!(config.get::<i64>("int_val").unwrap(), 42);
    assert_eq!(config.get::<u32>("int_val").unwrap(), 42);
    assert_eq!(config.get::<f64>("float_val").unwrap(), 2.5);
    assert!(config.get::<bool>("bool_val").unwrap());
    assert_eq!(config.get::<String>("int_val").unwrap(), "42");
    assert!(config.get::<Option<String>>("null_val").unwrap().is_none());
    assert_eq!(
        config.get::<Duration>("timeout").unwrap(),
        Duration::from_millis(1500)
    );
}

#[test]
fn test_negative_value_for_unsigned_is_mismatch() {
    let mut config = TenantryConfig::empty();
    config.set("data.pool", ConfigValue::Integer(-1));
    assert!(matches!(
        config.get::<u32>("data.pool"),
        Err(ConfigError::TypeMismatch { expected: "u32", .. })
    ));
}

#[test]
fn test_flatten_yaml() {
    let yaml = r#"
data:
  backend: sqlite
  url: "sqlite::memory:"
  page:
    size: 25
  entities:
    - customer
    - invoice
"#;
    let config = TenantryConfig::from_yaml_str(yaml, "test").unwrap();

    assert_eq!(config.get::<String>("data.url").unwrap(), "sqlite::memory:");
    assert_eq!(config.get::<u64>("data.page.size").unwrap(), 25);
    let entities: Vec<String> = config.get("data.entities").unwrap();
    assert_eq!(entities, vec!["customer", "invoice"]);
    assert_eq!(config.get::<String>("data.entities.0").unwrap(), "customer");
}

#[test]
fn test_comma_separated_list() {
    let mut config = TenantryConfig::empty();
    config.set("data.entities", ConfigValue::String("customer, invoice,".into()));
    let entities: Vec<String> = config.get("data.entities").unwrap();
    assert_eq!(entities, vec!["customer", "invoice"]);
}

#[test]
fn test_invalid_yaml_is_load_error() {
    let result = TenantryConfig::from_yaml_str("data: [unclosed", "test");
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

struct PoolSettings {
    size: u32,
}

impl ConfigSection for PoolSettings {
    fn prefix() -> &'static str {
        "data.pool"
    }

    fn from_config(config: &TenantryConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            size: config.get_or("data.pool", 5)?,
        })
    }
}

#[test]
fn test_with_typed_section() {
    let config = TenantryConfig::from_yaml_str("data:\n  pool: 8\n", "test")
        .unwrap()
        .with_typed::<PoolSettings>()
        .unwrap();
    assert_eq!(config.size, 8);
    assert_eq!(config.raw().get::<u32>("data.pool").unwrap(), 8);
}

#[test]
#[serial]
fn test_load_from_directory_with_profile_and_env() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("application.yaml"),
        "data:\n  backend: memory\n  url: \"sqlite://${TENANTRY_TEST_DB}\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("application-prod.yaml"),
        "data:\n  backend: sqlite\n",
    )
    .unwrap();

    std::env::set_var("TENANTRY_TEST_DB", "/var/lib/tenantry.db");
    std::env::set_var("DATA_TRANSACTION_TIMEOUT", "2500");
    std::env::remove_var(tenantry_core::config::PROFILE_ENV);

    let config = TenantryConfig::load_from(dir.path(), "prod", &DefaultSecretResolver).unwrap();

    assert_eq!(config.profile(), "prod");
    assert_eq!(config.get::<String>("data.backend").unwrap(), "sqlite");
    assert_eq!(
        config.get::<String>("data.url").unwrap(),
        "sqlite:///var/lib/tenantry.db"
    );
    assert_eq!(
        config.get::<Duration>("data.transaction.timeout").unwrap(),
        Duration::from_millis(2500)
    );

    std::env::remove_var("TENANTRY_TEST_DB");
    std::env::remove_var("DATA_TRANSACTION_TIMEOUT");
}
