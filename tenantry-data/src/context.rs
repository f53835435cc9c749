use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DataError;
use crate::tx::Transaction;

/// Request-scoped carrier for cancellation, deadline, tenant and the
/// ambient transaction.
///
/// Cloning is cheap. Derived contexts (`with_timeout`, `child`) get a child
/// cancellation token, so cancelling the parent cancels them too but not the
/// other way round.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    tenant: Option<Arc<str>>,
    transaction: Option<Arc<Transaction>>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..Self::default()
        }
    }

    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        ctx
    }

    pub fn with_tenant(&self, tenant: impl Into<Arc<str>>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            ..self.clone()
        }
    }

    pub fn with_transaction(&self, tx: Arc<Transaction>) -> Self {
        Self {
            transaction: Some(tx),
            ..self.clone()
        }
    }

    pub fn without_transaction(&self) -> Self {
        Self {
            transaction: None,
            ..self.clone()
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    /// The earlier of the context deadline and the ambient transaction's deadline.
    pub fn effective_deadline(&self) -> Option<Instant> {
        let tx_deadline = self.transaction.as_ref().and_then(|tx| tx.deadline());
        match (self.deadline, tx_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<(), DataError> {
        if self.is_cancelled() {
            return Err(DataError::Cancelled);
        }
        if self
            .effective_deadline()
            .is_some_and(|deadline| deadline <= Instant::now())
        {
            return Err(DataError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the context is cancelled or the
    /// deadline passes. The future is dropped on interruption.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, DataError>
    where
        F: Future<Output = Result<T, DataError>>,
    {
        self.check()?;
        let deadline = self.effective_deadline();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DataError::Cancelled),
            _ = sleep_until(deadline) => Err(DataError::DeadlineExceeded),
            res = fut => res,
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The transaction carried by `ctx`, if any.
pub fn get_transaction(ctx: &Context) -> Option<Arc<Transaction>> {
    ctx.transaction().cloned()
}
