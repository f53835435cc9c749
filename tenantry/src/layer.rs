use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tenantry_core::{ConfigError, ConfigSection, TenantryConfig};
use tenantry_data::backend::{Backend, Connection};
use tenantry_data::memory::{self, MemoryBackend};
use tenantry_data::{
    Context, DataError, EntitySchema, ListParams, PageQuery, RegistryBuilder, Repository,
    RepositoryRegistry, TransactionManager, TransactionOptions, TypedRepository,
};

use crate::settings::{BackendKind, DataSettings};

/// Failure while assembling a [`DataLayer`].
#[derive(Debug)]
pub enum BootstrapError {
    Config(ConfigError),
    Data(DataError),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapError::Config(e) => write!(f, "data layer configuration: {e}"),
            BootstrapError::Data(e) => write!(f, "data layer startup: {e}"),
        }
    }
}

impl std::error::Error for BootstrapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BootstrapError::Config(e) => Some(e),
            BootstrapError::Data(e) => Some(e),
        }
    }
}

impl From<ConfigError> for BootstrapError {
    fn from(err: ConfigError) -> Self {
        BootstrapError::Config(err)
    }
}

impl From<DataError> for BootstrapError {
    fn from(err: DataError) -> Self {
        BootstrapError::Data(err)
    }
}

/// The assembled persistence layer: one connection, the registry, a
/// repository per configured entity and the connection's transaction manager.
///
/// ```ignore
/// let config = TenantryConfig::load("dev")?;
/// let data = DataLayer::bootstrap(&config).await?;
///
/// let invoices = data.repository("invoice")?;
/// data.run_in_transaction(&ctx, |ctx| async move {
///     invoices.create(&ctx, record).await
/// })
/// .await?;
/// ```
pub struct DataLayer {
    settings: DataSettings,
    registry: RepositoryRegistry,
    connection: Arc<dyn Connection>,
    backend: Arc<dyn Backend>,
    transactions: Arc<dyn TransactionManager>,
    repositories: HashMap<String, Arc<dyn Repository>>,
}

impl DataLayer {
    /// Read the `data` section and assemble the layer.
    pub async fn bootstrap(config: &TenantryConfig) -> Result<Self, BootstrapError> {
        let settings = DataSettings::from_config(config)?;
        Self::from_settings(settings).await
    }

    pub async fn from_settings(settings: DataSettings) -> Result<Self, BootstrapError> {
        let registry = build_registry(&settings)?;

        let (connection, backend) = match settings.backend {
            BackendKind::Memory => handles(Arc::new(MemoryBackend::new())),
            BackendKind::Sqlite => connect_sqlite(&settings).await?,
        };
        let transactions = backend.transactions();

        let mut repositories = HashMap::with_capacity(settings.entities.len());
        for entity in &settings.entities {
            let repository = registry.create(
                settings.backend.name(),
                &entity.name,
                connection.clone(),
                &entity.physical_name,
            )?;
            repositories.insert(entity.name.clone(), repository);
        }

        tracing::info!(
            backend = %settings.backend,
            entities = repositories.len(),
            transactions = transactions.supports_transactions(),
            "Data layer ready"
        );

        Ok(Self {
            settings,
            registry,
            connection,
            backend,
            transactions,
            repositories,
        })
    }

    pub fn settings(&self) -> &DataSettings {
        &self.settings
    }

    pub fn registry(&self) -> &RepositoryRegistry {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Repository of a configured entity.
    pub fn repository(&self, entity: &str) -> Result<Arc<dyn Repository>, DataError> {
        self.repositories
            .get(entity)
            .cloned()
            .ok_or_else(|| DataError::UnknownBackendOrEntity {
                backend: self.settings.backend.name().to_string(),
                entity: entity.to_string(),
            })
    }

    /// Repository for a configured entity under another physical name, for
    /// instance a per-tenant table.
    pub fn repository_at(
        &self,
        entity: &str,
        physical_name: &str,
    ) -> Result<Arc<dyn Repository>, DataError> {
        self.registry.create(
            self.settings.backend.name(),
            entity,
            self.connection.clone(),
            physical_name,
        )
    }

    pub fn typed<T: EntitySchema>(&self) -> Result<TypedRepository<T>, DataError> {
        Ok(TypedRepository::new(self.repository(T::ENTITY)?))
    }

    pub fn transactions(&self) -> Arc<dyn TransactionManager> {
        self.transactions.clone()
    }

    /// Options carrying the configured default timeout.
    pub fn transaction_options(&self) -> TransactionOptions {
        match self.settings.transaction_timeout {
            Some(timeout) => TransactionOptions::new().timeout(timeout),
            None => TransactionOptions::new(),
        }
    }

    /// Run `f` as one unit of work with the configured default options.
    pub async fn run_in_transaction<F, Fut, T>(&self, ctx: &Context, f: F) -> Result<T, DataError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, DataError>>,
    {
        tenantry_data::run_in_transaction(&*self.transactions, ctx, self.transaction_options(), f)
            .await
    }

    /// Page query using the configured default page size.
    pub fn page_query(&self, params: ListParams) -> PageQuery {
        PageQuery::new(params).default_page_size(self.settings.page_size)
    }

    pub async fn ping(&self, ctx: &Context) -> Result<(), DataError> {
        self.backend.ping(ctx).await
    }
}

impl fmt::Debug for DataLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entities: Vec<_> = self.repositories.keys().collect();
        entities.sort();
        f.debug_struct("DataLayer")
            .field("backend", &self.settings.backend)
            .field("connection", &self.connection.connection_id())
            .field("entities", &entities)
            .finish()
    }
}

/// Register every configured entity with every compiled-in backend.
fn build_registry(settings: &DataSettings) -> Result<RepositoryRegistry, DataError> {
    let mut builder = RegistryBuilder::new();
    for entity in &settings.entities {
        let fields: Vec<&str> = entity.search_fields.iter().map(String::as_str).collect();
        memory::register(&mut builder, &entity.name, &fields)?;
        #[cfg(feature = "sqlite")]
        tenantry_data_sqlx::register(&mut builder, &entity.name, &fields)?;
    }
    Ok(builder.build())
}

fn handles<B: Backend>(backend: Arc<B>) -> (Arc<dyn Connection>, Arc<dyn Backend>) {
    let connection: Arc<dyn Connection> = backend.clone();
    let backend: Arc<dyn Backend> = backend;
    (connection, backend)
}

#[cfg(feature = "sqlite")]
async fn connect_sqlite(
    settings: &DataSettings,
) -> Result<(Arc<dyn Connection>, Arc<dyn Backend>), DataError> {
    let backend = tenantry_data_sqlx::SqlxBackend::connect(&settings.url, settings.pool).await?;
    Ok(handles(Arc::new(backend)))
}

#[cfg(not(feature = "sqlite"))]
async fn connect_sqlite(
    _settings: &DataSettings,
) -> Result<(Arc<dyn Connection>, Arc<dyn Backend>), DataError> {
    Err(DataError::Unsupported(
        "the sqlite backend is not compiled in".into(),
    ))
}
