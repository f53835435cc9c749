use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use uuid::Uuid;

use crate::context::Context;
use crate::error::DataError;

/// Lifecycle of a [`Transaction`]. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Pending => write!(f, "pending"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled back"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// The transaction is rolled back automatically once this elapses.
    pub timeout: Option<Duration>,
    pub read_only: bool,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Backend half of a transaction: owns the native session.
#[async_trait]
pub trait TransactionDriver: Send + 'static {
    async fn commit(self: Box<Self>) -> Result<(), DataError>;
    async fn rollback(self: Box<Self>) -> Result<(), DataError>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TxInner {
    state: TransactionState,
    driver: Option<Box<dyn TransactionDriver>>,
}

/// A handle on an open backend session.
///
/// Shared as `Arc<Transaction>` through [`Context`]. Every repository call
/// carrying the context joins the session until it is committed or rolled back.
pub struct Transaction {
    id: Uuid,
    connection_id: Uuid,
    read_only: bool,
    deadline: Option<Instant>,
    expired: AtomicBool,
    inner: Mutex<TxInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("read_only", &self.read_only)
            .field("expired", &self.expired.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Wrap an opened driver. When the options carry a timeout a watchdog
    /// task rolls the transaction back once it elapses.
    pub fn begin(
        connection_id: Uuid,
        options: &TransactionOptions,
        driver: Box<dyn TransactionDriver>,
    ) -> Arc<Self> {
        let tx = Arc::new(Self {
            id: Uuid::new_v4(),
            connection_id,
            read_only: options.read_only,
            deadline: options.timeout.map(|t| Instant::now() + t),
            expired: AtomicBool::new(false),
            inner: Mutex::new(TxInner {
                state: TransactionState::Pending,
                driver: Some(driver),
            }),
        });
        if let Some(deadline) = tx.deadline {
            tokio::spawn(watchdog(Arc::downgrade(&tx), deadline));
        }
        tracing::debug!(tx = %tx.id, read_only = tx.read_only, "Transaction started");
        tx
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// `true` once the timeout rolled the transaction back.
    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> TransactionState {
        self.inner.lock().await.state
    }

    pub async fn commit(&self) -> Result<(), DataError> {
        let mut inner = self.inner.lock().await;
        if self.is_expired() {
            return Err(DataError::DeadlineExceeded);
        }
        if inner.state != TransactionState::Pending {
            return Err(DataError::InvalidTransactionState {
                state: inner.state,
                action: "commit",
            });
        }
        if self.past_deadline() {
            self.expire_locked(&mut inner).await;
            return Err(DataError::DeadlineExceeded);
        }
        let driver = inner.driver.take();
        // A failed commit leaves nothing applied.
        inner.state = TransactionState::RolledBack;
        if let Some(driver) = driver {
            driver.commit().await?;
        }
        inner.state = TransactionState::Committed;
        tracing::debug!(tx = %self.id, "Transaction committed");
        Ok(())
    }

    /// Roll back. Calling this on an already rolled back transaction is a no-op.
    pub async fn rollback(&self) -> Result<(), DataError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            TransactionState::RolledBack => Ok(()),
            TransactionState::Committed => Err(DataError::InvalidTransactionState {
                state: inner.state,
                action: "roll back",
            }),
            TransactionState::Pending => {
                inner.state = TransactionState::RolledBack;
                let result = match inner.driver.take() {
                    Some(driver) => driver.rollback().await,
                    None => Ok(()),
                };
                tracing::debug!(tx = %self.id, ok = result.is_ok(), "Transaction rolled back");
                result
            }
        }
    }

    /// Drop the driver without waiting on it. The native session is released
    /// uncommitted. Does nothing unless the transaction is still pending.
    pub fn abandon(&self) {
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if inner.state == TransactionState::Pending {
            inner.state = TransactionState::RolledBack;
            drop(inner.driver.take());
            tracing::warn!(tx = %self.id, "Transaction abandoned");
        }
    }

    /// Lock the native session for one operation.
    ///
    /// Fails with `DeadlineExceeded` once the timeout has elapsed and with
    /// `InvalidTransactionState` after commit or rollback.
    pub async fn session(&self) -> Result<TransactionSession<'_>, DataError> {
        let mut inner = self.inner.lock().await;
        if self.is_expired() {
            return Err(DataError::DeadlineExceeded);
        }
        if inner.state != TransactionState::Pending {
            return Err(DataError::InvalidTransactionState {
                state: inner.state,
                action: "use",
            });
        }
        if self.past_deadline() {
            self.expire_locked(&mut inner).await;
            return Err(DataError::DeadlineExceeded);
        }
        Ok(TransactionSession { guard: inner })
    }

    fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| d <= Instant::now())
    }

    async fn expire(&self) {
        let mut inner = self.inner.lock().await;
        self.expire_locked(&mut inner).await;
    }

    async fn expire_locked(&self, inner: &mut TxInner) {
        if inner.state != TransactionState::Pending {
            return;
        }
        self.expired.store(true, Ordering::Release);
        inner.state = TransactionState::RolledBack;
        if let Some(driver) = inner.driver.take() {
            if let Err(err) = driver.rollback().await {
                tracing::error!(tx = %self.id, error = %err, "Rollback after timeout failed");
            }
        }
        tracing::warn!(tx = %self.id, "Transaction timed out and was rolled back");
    }
}

async fn watchdog(tx: Weak<Transaction>, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(tx) = tx.upgrade() {
        tx.expire().await;
    }
}

/// Exclusive access to a pending transaction's driver.
pub struct TransactionSession<'a> {
    guard: MutexGuard<'a, TxInner>,
}

impl TransactionSession<'_> {
    /// Downcast the driver to the backend's concrete type.
    pub fn driver_mut<D: TransactionDriver>(&mut self) -> Result<&mut D, DataError> {
        self.guard
            .driver
            .as_mut()
            .and_then(|driver| driver.as_any_mut().downcast_mut::<D>())
            .ok_or_else(|| DataError::ConnectionMismatch {
                expected: std::any::type_name::<D>().to_string(),
                actual: "foreign transaction driver".to_string(),
            })
    }
}

/// Starts transactions on one connection.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Identity of the connection transactions are opened on.
    fn connection_id(&self) -> Uuid;

    fn supports_transactions(&self) -> bool;

    async fn start(
        &self,
        ctx: &Context,
        options: TransactionOptions,
    ) -> Result<Arc<Transaction>, DataError>;
}

/// Manager for backends without transactions.
#[derive(Debug, Clone)]
pub struct NoTransactions {
    connection_id: Uuid,
}

impl NoTransactions {
    pub fn new(connection_id: Uuid) -> Self {
        Self { connection_id }
    }
}

#[async_trait]
impl TransactionManager for NoTransactions {
    fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    async fn start(
        &self,
        _ctx: &Context,
        _options: TransactionOptions,
    ) -> Result<Arc<Transaction>, DataError> {
        Err(DataError::Unsupported("transactions".into()))
    }
}

/// Run `f` as one atomic unit of work.
///
/// - `Ok` commits, `Err` rolls back and returns the error. If the rollback
///   fails as well the result is [`DataError::Rollback`] carrying both.
/// - A panic rolls back and then resumes unwinding.
/// - Commit and rollback are bounded by `ctx`. When the context is cancelled
///   or its deadline passes first, the transaction is abandoned uncommitted.
/// - A transaction for the same connection already carried by `ctx` is
///   joined instead of starting a new one; the outer caller decides the outcome.
/// - Managers that do not support transactions run `f` directly.
pub async fn run_in_transaction<F, Fut, T>(
    manager: &dyn TransactionManager,
    ctx: &Context,
    options: TransactionOptions,
    f: F,
) -> Result<T, DataError>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<T, DataError>>,
{
    if let Some(tx) = ctx.transaction() {
        if tx.connection_id() == manager.connection_id() {
            tracing::trace!(tx = %tx.id(), "Joining ambient transaction");
            return f(ctx.clone()).await;
        }
    }
    if !manager.supports_transactions() {
        tracing::debug!("Backend has no transactions, running unit of work directly");
        return f(ctx.clone()).await;
    }

    let tx = manager.start(ctx, options).await?;
    let tx_ctx = ctx.with_transaction(tx.clone());

    match AssertUnwindSafe(f(tx_ctx)).catch_unwind().await {
        Ok(Ok(value)) => match ctx.run(tx.commit()).await {
            Ok(()) => Ok(value),
            Err(err) => {
                if err.is_interrupted() {
                    tx.abandon();
                }
                Err(err)
            }
        },
        Ok(Err(err)) => match rollback_within(ctx, &tx).await {
            Ok(()) => Err(err),
            Err(rollback) => Err(DataError::Rollback {
                source: Box::new(err),
                rollback: Box::new(rollback),
            }),
        },
        Err(panic) => {
            if let Err(err) = rollback_within(ctx, &tx).await {
                tracing::error!(tx = %tx.id(), error = %err, "Rollback after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Roll back under `ctx`, abandoning the transaction when interrupted.
async fn rollback_within(ctx: &Context, tx: &Transaction) -> Result<(), DataError> {
    match ctx.run(tx.rollback()).await {
        Err(err) if err.is_interrupted() => {
            tx.abandon();
            Ok(())
        }
        other => other,
    }
}
