//! SQLite transactions behind the backend-neutral [`Transaction`] handle.
//!
//! [`SqliteTransactions`] begins an `sqlx::Transaction` from the pool and
//! wraps it in a [`Tx`] driver. Dropping a `Tx` without committing rolls
//! the native transaction back.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tenantry_data::tx::TransactionDriver;
use tenantry_data::{Context, DataError, Transaction, TransactionManager, TransactionOptions};
use uuid::Uuid;

use crate::error::SqlxErrorExt;

/// The task (or, outside any task, the thread) that began a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Holder {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl Holder {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Holder::Task(id),
            None => Holder::Thread(std::thread::current().id()),
        }
    }
}

/// Open transactions and who began them. Entries leave with their `Tx`.
type Holders = Arc<DashMap<Uuid, Holder>>;

struct HolderEntry {
    holders: Holders,
    key: Uuid,
}

impl Drop for HolderEntry {
    fn drop(&mut self) {
        self.holders.remove(&self.key);
    }
}

/// Native SQLite transaction owned by a [`Transaction`].
pub struct Tx {
    native: Option<sqlx::Transaction<'static, Sqlite>>,
    _holder: Option<HolderEntry>,
}

impl Tx {
    pub fn new(tx: sqlx::Transaction<'static, Sqlite>) -> Self {
        Self {
            native: Some(tx),
            _holder: None,
        }
    }

    /// Returns a mutable reference to the underlying connection.
    pub fn as_mut(&mut self) -> Result<&mut SqliteConnection, DataError> {
        self.native
            .as_deref_mut()
            .ok_or_else(|| DataError::Other("transaction already finished".into()))
    }
}

#[async_trait]
impl TransactionDriver for Tx {
    async fn commit(mut self: Box<Self>) -> Result<(), DataError> {
        match self.native.take() {
            Some(tx) => tx.commit().await.map_err(SqlxErrorExt::into_data_error),
            None => Ok(()),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), DataError> {
        match self.native.take() {
            Some(tx) => tx.rollback().await.map_err(SqlxErrorExt::into_data_error),
            None => Ok(()),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Starts transactions on one SQLite pool.
#[derive(Clone)]
pub struct SqliteTransactions {
    pool: SqlitePool,
    connection_id: Uuid,
    holders: Holders,
}

impl SqliteTransactions {
    pub fn new(pool: SqlitePool, connection_id: Uuid) -> Self {
        Self {
            pool,
            connection_id,
            holders: Arc::default(),
        }
    }

    /// Number of transactions begun and not yet finished.
    pub fn open(&self) -> usize {
        self.holders.len()
    }

    /// `true` when the calling task began a transaction that is still open.
    pub fn held_by_current(&self) -> bool {
        let current = Holder::current();
        self.holders.iter().any(|entry| *entry.value() == current)
    }
}

#[async_trait]
impl TransactionManager for SqliteTransactions {
    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn start(
        &self,
        ctx: &Context,
        options: TransactionOptions,
    ) -> Result<Arc<Transaction>, DataError> {
        if self.pool.options().get_max_connections() == 1 && self.held_by_current() {
            return Err(DataError::Other(
                "the only connection is held by this task's open transaction".into(),
            ));
        }
        let native = ctx
            .run(async { self.pool.begin().await.map_err(SqlxErrorExt::into_data_error) })
            .await?;
        let key = Uuid::new_v4();
        self.holders.insert(key, Holder::current());
        let driver = Tx {
            native: Some(native),
            _holder: Some(HolderEntry {
                holders: self.holders.clone(),
                key,
            }),
        };
        Ok(Transaction::begin(self.connection_id, &options, Box::new(driver)))
    }
}
