use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Connection, Repository};
use crate::error::DataError;

/// Builds a repository from a connection handle and a physical entity name.
pub type Constructor =
    Arc<dyn Fn(Arc<dyn Connection>, &str) -> Result<Arc<dyn Repository>, DataError> + Send + Sync>;

type Key = (String, String);

/// Collects repository constructors during startup.
///
/// ```ignore
/// let mut builder = RegistryBuilder::new();
/// tenantry_data::memory::register(&mut builder, "customer", &["name"])?;
/// let registry = builder.build();
/// let customers = registry.create("memory", "customer", connection, "customers")?;
/// ```
#[derive(Default)]
pub struct RegistryBuilder {
    constructors: HashMap<Key, Constructor>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. A second registration for the same
    /// backend/entity pair fails with `DuplicateRegistration`.
    pub fn register(
        &mut self,
        backend: &str,
        entity: &str,
        constructor: Constructor,
    ) -> Result<&mut Self, DataError> {
        let key = (backend.to_string(), entity.to_string());
        if self.constructors.contains_key(&key) {
            return Err(DataError::DuplicateRegistration {
                backend: key.0,
                entity: key.1,
            });
        }
        tracing::debug!(backend, entity, "Registered repository constructor");
        self.constructors.insert(key, constructor);
        Ok(self)
    }

    pub fn contains(&self, backend: &str, entity: &str) -> bool {
        self.constructors
            .contains_key(&(backend.to_string(), entity.to_string()))
    }

    /// Freeze the registrations. The result is read-only and cheap to clone.
    pub fn build(self) -> RepositoryRegistry {
        RepositoryRegistry {
            constructors: Arc::new(self.constructors),
        }
    }
}

/// Read-only map from (backend, entity) to repository constructor.
#[derive(Clone)]
pub struct RepositoryRegistry {
    constructors: Arc<HashMap<Key, Constructor>>,
}

impl RepositoryRegistry {
    /// Construct a repository for `entity` on `connection`.
    pub fn create(
        &self,
        backend: &str,
        entity: &str,
        connection: Arc<dyn Connection>,
        physical_name: &str,
    ) -> Result<Arc<dyn Repository>, DataError> {
        let constructor = self
            .constructors
            .get(&(backend.to_string(), entity.to_string()))
            .ok_or_else(|| DataError::UnknownBackendOrEntity {
                backend: backend.to_string(),
                entity: entity.to_string(),
            })?;
        constructor(connection, physical_name)
    }

    pub fn contains(&self, backend: &str, entity: &str) -> bool {
        self.constructors
            .contains_key(&(backend.to_string(), entity.to_string()))
    }

    /// Entities registered for `backend`, sorted.
    pub fn entities(&self, backend: &str) -> Vec<&str> {
        let mut entities: Vec<&str> = self
            .constructors
            .keys()
            .filter(|(b, _)| b == backend)
            .map(|(_, e)| e.as_str())
            .collect();
        entities.sort_unstable();
        entities
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl std::fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.constructors.keys().collect();
        keys.sort();
        f.debug_struct("RepositoryRegistry").field("entries", &keys).finish()
    }
}
