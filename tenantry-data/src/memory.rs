//! In-process backend used by tests and single-node development setups.
//!
//! Records live in a `DashMap` keyed by entity name. It has no transactions:
//! [`run_in_transaction`](crate::tx::run_in_transaction) runs units of work
//! against it directly.

use std::any::Any;
use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

use crate::backend::{Backend, BackendRepository, Connection};
use crate::context::Context;
use crate::error::DataError;
use crate::lifecycle::{apply_update, deactivate, is_visible, prepare_insert};
use crate::page::ListParams;
use crate::query::QueryBuilder;
use crate::record::{fields, Record, Value};
use crate::registry::RegistryBuilder;
use crate::tx::{NoTransactions, TransactionManager};

pub const BACKEND_NAME: &str = "memory";

pub struct MemoryBackend {
    id: Uuid,
    tables: DashMap<String, Vec<Record>>,
    transactions: Arc<NoTransactions>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            tables: DashMap::new(),
            transactions: Arc::new(NoTransactions::new(id)),
        }
    }

    /// Number of stored records for `entity`, soft-deleted ones included.
    pub fn stored_count(&self, entity: &str) -> usize {
        self.tables.get(entity).map(|t| t.len()).unwrap_or(0)
    }

    fn find_visible<'a>(
        ctx: &Context,
        table: &'a mut [Record],
        id: &str,
    ) -> Option<&'a mut Record> {
        table
            .iter_mut()
            .find(|r| r.id() == Some(id) && is_visible(ctx, r, false))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a memory-backed repository constructor for `entity`.
pub fn register(
    builder: &mut RegistryBuilder,
    entity: &str,
    search_fields: &[&str],
) -> Result<(), DataError> {
    builder.register(
        BACKEND_NAME,
        entity,
        BackendRepository::<MemoryBackend>::constructor(entity, search_fields),
    )?;
    Ok(())
}

impl Connection for MemoryBackend {
    fn backend_name(&self) -> &str {
        BACKEND_NAME
    }

    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create(&self, ctx: &Context, entity: &str, record: Record) -> Result<Record, DataError> {
        ctx.run(async {
            let record = prepare_insert(ctx, record);
            let mut table = self.tables.entry(entity.to_string()).or_default();
            if table.iter().any(|r| r.id() == record.id()) {
                return Err(DataError::Write(format!(
                    "{entity} '{}' already exists",
                    record.id().unwrap_or_default()
                )));
            }
            table.push(record.clone());
            tracing::trace!(entity, id = record.id(), "Created record");
            Ok(record)
        })
        .await
    }

    async fn read(&self, ctx: &Context, entity: &str, id: &str) -> Result<Record, DataError> {
        ctx.run(async {
            self.tables
                .get(entity)
                .and_then(|t| {
                    t.iter()
                        .find(|r| r.id() == Some(id) && is_visible(ctx, r, false))
                        .cloned()
                })
                .ok_or_else(|| DataError::not_found(entity, id))
        })
        .await
    }

    async fn update(
        &self,
        ctx: &Context,
        entity: &str,
        id: &str,
        record: Record,
    ) -> Result<Record, DataError> {
        ctx.run(async {
            let mut table = self
                .tables
                .get_mut(entity)
                .ok_or_else(|| DataError::not_found(entity, id))?;
            let stored = Self::find_visible(ctx, &mut table, id)
                .ok_or_else(|| DataError::not_found(entity, id))?;
            apply_update(stored, record);
            Ok(stored.clone())
        })
        .await
    }

    async fn delete(&self, ctx: &Context, entity: &str, id: &str) -> Result<(), DataError> {
        ctx.run(async {
            let mut table = self
                .tables
                .get_mut(entity)
                .ok_or_else(|| DataError::not_found(entity, id))?;
            let stored = Self::find_visible(ctx, &mut table, id)
                .ok_or_else(|| DataError::not_found(entity, id))?;
            deactivate(stored);
            tracing::trace!(entity, id, "Soft-deleted record");
            Ok(())
        })
        .await
    }

    async fn list(
        &self,
        ctx: &Context,
        entity: &str,
        params: &ListParams,
    ) -> Result<(Vec<Record>, u64), DataError> {
        ctx.run(async {
            let Some(table) = self.tables.get(entity) else {
                return Ok((Vec::new(), 0));
            };
            // Count and page come from the same guard.
            let mut matched: Vec<&Record> = table
                .iter()
                .filter(|r| is_visible(ctx, r, params.include_inactive) && params.matches(r))
                .collect();
            let sort = params.sort.clone().unwrap_or_default();
            sort_records(&mut matched, &[(sort.field.clone(), sort.is_ascending())]);

            let total = matched.len() as u64;
            let items = matched
                .into_iter()
                .skip(usize::try_from(params.offset()).unwrap_or(usize::MAX))
                .take(params.limit() as usize)
                .cloned()
                .collect();
            Ok((items, total))
        })
        .await
    }

    async fn query(
        &self,
        ctx: &Context,
        entity: &str,
        query: &QueryBuilder,
    ) -> Result<Vec<Record>, DataError> {
        query.validate()?;
        ctx.run(async {
            let Some(table) = self.tables.get(entity) else {
                return Ok(Vec::new());
            };
            let mut matched: Vec<&Record> = table
                .iter()
                .filter(|r| is_visible(ctx, r, query.includes_inactive()) && query.matches(r))
                .collect();
            if !query.order().is_empty() {
                sort_records(&mut matched, query.order());
            }
            let offset = query.offset_value().unwrap_or(0) as usize;
            let limit = query.limit_value().map_or(usize::MAX, |l| l as usize);
            Ok(matched.into_iter().skip(offset).take(limit).cloned().collect())
        })
        .await
    }

    async fn ping(&self, ctx: &Context) -> Result<(), DataError> {
        ctx.check()
    }

    fn transactions(&self) -> Arc<dyn TransactionManager> {
        self.transactions.clone()
    }
}

/// Sort by the given keys, then by id so pages are deterministic.
fn sort_records(records: &mut [&Record], order: &[(String, bool)]) {
    records.sort_by(|a, b| {
        order
            .iter()
            .map(|(field, ascending)| {
                let x = a.get_path(field).unwrap_or(&Value::Null);
                let y = b.get_path(field).unwrap_or(&Value::Null);
                let ord = x.sort_cmp(y);
                if *ascending {
                    ord
                } else {
                    ord.reverse()
                }
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.get_str(fields::ID).cmp(&b.get_str(fields::ID)))
    });
}
