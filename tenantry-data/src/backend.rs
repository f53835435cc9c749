use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::Context;
use crate::error::DataError;
use crate::page::ListParams;
use crate::query::QueryBuilder;
use crate::record::{Record, Value};
use crate::registry::Constructor;
use crate::tx::TransactionManager;

/// A live handle on a storage backend (pool, client, in-memory store).
pub trait Connection: Send + Sync + 'static {
    /// Registry key of the backend kind (`"memory"`, `"sqlite"`).
    fn backend_name(&self) -> &str;

    /// Identity used to decide whether a transaction belongs to this connection.
    fn connection_id(&self) -> Uuid;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Downcast a connection handle to the concrete type a constructor expects.
pub fn downcast_connection<C: Connection>(
    connection: Arc<dyn Connection>,
) -> Result<Arc<C>, DataError> {
    let actual = connection.backend_name().to_string();
    connection
        .into_any()
        .downcast::<C>()
        .map_err(|_| DataError::ConnectionMismatch {
            expected: std::any::type_name::<C>().to_string(),
            actual,
        })
}

/// The operations every storage backend provides, addressed by physical
/// entity name.
///
/// - `create` assigns `id` when missing, sets `active = true`, stamps
///   `date_created`/`date_modified` and the tenant from the context.
/// - `update` merges the given fields into the stored record. `id`, `active`,
///   `tenant_id` and `date_created` never change; `date_modified` is restamped.
/// - `delete` is a soft delete.
/// - Everything except `include_inactive` queries only sees active records of
///   the context's tenant.
#[async_trait]
pub trait Backend: Connection {
    async fn create(&self, ctx: &Context, entity: &str, record: Record) -> Result<Record, DataError>;

    async fn read(&self, ctx: &Context, entity: &str, id: &str) -> Result<Record, DataError>;

    async fn update(
        &self,
        ctx: &Context,
        entity: &str,
        id: &str,
        record: Record,
    ) -> Result<Record, DataError>;

    async fn delete(&self, ctx: &Context, entity: &str, id: &str) -> Result<(), DataError>;

    /// One page of matches and the total number of matches, taken from the
    /// same snapshot. `params` must be normalized.
    async fn list(
        &self,
        ctx: &Context,
        entity: &str,
        params: &ListParams,
    ) -> Result<(Vec<Record>, u64), DataError>;

    async fn query(
        &self,
        ctx: &Context,
        entity: &str,
        query: &QueryBuilder,
    ) -> Result<Vec<Record>, DataError>;

    /// Cheap liveness check.
    async fn ping(&self, ctx: &Context) -> Result<(), DataError>;

    fn transactions(&self) -> Arc<dyn TransactionManager>;

    fn raw_query_capable(&self) -> Option<&dyn RawQueryCapable> {
        None
    }
}

/// Backends that accept native query text.
#[async_trait]
pub trait RawQueryCapable: Send + Sync {
    async fn raw_query(
        &self,
        ctx: &Context,
        statement: &str,
        binds: &[Value],
    ) -> Result<Vec<Record>, DataError>;
}

/// An entity-bound handle on a backend.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Logical entity name the repository was created for.
    fn entity(&self) -> &str;

    /// Name of the table or collection in the backend.
    fn physical_name(&self) -> &str;

    fn backend_name(&self) -> &str;

    fn connection_id(&self) -> Uuid;

    async fn create(&self, ctx: &Context, record: Record) -> Result<Record, DataError>;

    async fn read(&self, ctx: &Context, id: &str) -> Result<Record, DataError>;

    async fn update(&self, ctx: &Context, id: &str, record: Record) -> Result<Record, DataError>;

    async fn delete(&self, ctx: &Context, id: &str) -> Result<(), DataError>;

    async fn list(&self, ctx: &Context, params: &ListParams)
        -> Result<(Vec<Record>, u64), DataError>;

    async fn query(&self, ctx: &Context, query: &QueryBuilder) -> Result<Vec<Record>, DataError>;

    async fn ping(&self, ctx: &Context) -> Result<(), DataError>;

    fn transactions(&self) -> Arc<dyn TransactionManager>;

    fn as_raw_query(&self) -> Option<&dyn RawQueryCapable> {
        None
    }
}

/// Default [`Repository`] over any [`Backend`].
pub struct BackendRepository<B: Backend> {
    backend: Arc<B>,
    entity: String,
    physical_name: String,
    search_fields: Vec<String>,
}

impl<B: Backend> BackendRepository<B> {
    pub fn new(backend: Arc<B>, entity: &str, physical_name: &str, search_fields: Vec<String>) -> Self {
        Self {
            backend,
            entity: entity.to_string(),
            physical_name: physical_name.to_string(),
            search_fields,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn search_fields(&self) -> &[String] {
        &self.search_fields
    }

    /// Registry constructor producing `BackendRepository<B>` for `entity`.
    pub fn constructor(entity: &str, search_fields: &[&str]) -> Constructor {
        let entity = entity.to_string();
        let search_fields: Vec<String> = search_fields.iter().map(|f| f.to_string()).collect();
        Arc::new(move |connection: Arc<dyn Connection>, physical_name: &str| {
            let backend = downcast_connection::<B>(connection)?;
            Ok(Arc::new(BackendRepository::new(
                backend,
                &entity,
                physical_name,
                search_fields.clone(),
            )) as Arc<dyn Repository>)
        })
    }
}

#[async_trait]
impl<B: Backend> Repository for BackendRepository<B> {
    fn entity(&self) -> &str {
        &self.entity
    }

    fn physical_name(&self) -> &str {
        &self.physical_name
    }

    fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    fn connection_id(&self) -> Uuid {
        self.backend.connection_id()
    }

    async fn create(&self, ctx: &Context, record: Record) -> Result<Record, DataError> {
        self.backend.create(ctx, &self.physical_name, record).await
    }

    async fn read(&self, ctx: &Context, id: &str) -> Result<Record, DataError> {
        self.backend.read(ctx, &self.physical_name, id).await
    }

    async fn update(&self, ctx: &Context, id: &str, record: Record) -> Result<Record, DataError> {
        self.backend.update(ctx, &self.physical_name, id, record).await
    }

    async fn delete(&self, ctx: &Context, id: &str) -> Result<(), DataError> {
        self.backend.delete(ctx, &self.physical_name, id).await
    }

    async fn list(
        &self,
        ctx: &Context,
        params: &ListParams,
    ) -> Result<(Vec<Record>, u64), DataError> {
        let mut params = params.normalized();
        if params.search_fields.is_empty() {
            params.search_fields = self.search_fields.clone();
        }
        self.backend.list(ctx, &self.physical_name, &params).await
    }

    async fn query(&self, ctx: &Context, query: &QueryBuilder) -> Result<Vec<Record>, DataError> {
        self.backend.query(ctx, &self.physical_name, query).await
    }

    async fn ping(&self, ctx: &Context) -> Result<(), DataError> {
        self.backend.ping(ctx).await
    }

    fn transactions(&self) -> Arc<dyn TransactionManager> {
        self.backend.transactions()
    }

    fn as_raw_query(&self) -> Option<&dyn RawQueryCapable> {
        self.backend.raw_query_capable()
    }
}
