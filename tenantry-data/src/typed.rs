use std::marker::PhantomData;
use std::sync::Arc;

use crate::backend::Repository;
use crate::context::Context;
use crate::error::DataError;
use crate::list::PageQuery;
use crate::mapper::{from_record, to_record};
use crate::page::{ListParams, Page};
use crate::query::QueryBuilder;
use crate::schema::EntitySchema;

/// A [`Repository`] that speaks in typed schemas instead of records.
///
/// ```ignore
/// let customers = TypedRepository::<Customer>::new(registry.create("sqlite", "customer", conn, "customers")?);
/// let saved = customers.create(&ctx, &Customer { name: "Acme".into(), ..Default::default() }).await?;
/// ```
pub struct TypedRepository<T> {
    inner: Arc<dyn Repository>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntitySchema> TypedRepository<T> {
    pub fn new(inner: Arc<dyn Repository>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// Get the underlying record repository.
    pub fn raw(&self) -> &Arc<dyn Repository> {
        &self.inner
    }

    pub async fn create(&self, ctx: &Context, value: &T) -> Result<T, DataError> {
        let record = self.inner.create(ctx, to_record(value)?).await?;
        from_record(&record)
    }

    pub async fn read(&self, ctx: &Context, id: &str) -> Result<T, DataError> {
        from_record(&self.inner.read(ctx, id).await?)
    }

    pub async fn update(&self, ctx: &Context, id: &str, value: &T) -> Result<T, DataError> {
        let record = self.inner.update(ctx, id, to_record(value)?).await?;
        from_record(&record)
    }

    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<(), DataError> {
        self.inner.delete(ctx, id).await
    }

    pub async fn list(&self, ctx: &Context, params: ListParams) -> Result<Page<T>, DataError> {
        PageQuery::new(params).fetch_as(ctx, self.inner.as_ref()).await
    }

    pub async fn query(&self, ctx: &Context, query: &QueryBuilder) -> Result<Vec<T>, DataError> {
        self.inner
            .query(ctx, query)
            .await?
            .iter()
            .map(from_record)
            .collect()
    }
}

impl<T> Clone for TypedRepository<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}
