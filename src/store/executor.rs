//! Transaction Executor
//!
//! Runs a unit of work against a transaction-scoped [`Querier`] and settles the
//! scope exactly once:
//!
//! ```text
//! begin ──▶ work(&tx) ──ok──▶ commit ──err──▶ Lifecycle(Commit)
//!               │
//!               └──err──▶ rollback ──ok──▶ work error
//!                             └──err──▶ Composite(work, Lifecycle(Rollback))
//! ```
//!
//! A canceled token makes the in-flight work future be dropped and takes the
//! rollback path. A panic inside the work rolls back before it resumes
//! unwinding. Nothing is retried.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::{StoreError, TxPhase};
use super::querier::Querier;

/// Result future of a unit of work bound to a transaction-scoped querier
pub type TxFuture<'q, T> = BoxFuture<'q, Result<T, StoreError>>;

/// Opens transaction scopes and runs units of work inside them.
///
/// The work closure has the same shape as `sqlx::Connection::transaction`:
///
/// ```ignore
/// store.exec_tx(&cancel, move |q| Box::pin(async move {
///     q.create_entry(params).await
/// })).await
/// ```
pub trait TxExecutor: Send + Sync {
    fn exec_tx<'a, T, F>(&'a self, cancel: &'a CancellationToken, work: F) -> TxFuture<'a, T>
    where
        T: Send + 'a,
        F: for<'q> FnOnce(&'q dyn Querier) -> TxFuture<'q, T> + Send + 'a;
}

/// An open transaction scope that must end in commit or rollback
#[async_trait]
pub trait TxScope: Querier + Sized {
    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Drive `work` inside an already begun `scope`, then commit or roll back.
///
/// Store adapters call this right after beginning their transaction.
pub async fn run_in_scope<S, T, F>(
    scope: S,
    cancel: &CancellationToken,
    work: F,
) -> Result<T, StoreError>
where
    S: TxScope,
    F: for<'q> FnOnce(&'q dyn Querier) -> TxFuture<'q, T>,
{
    let outcome = {
        let fut = work(&scope);
        AssertUnwindSafe(until_cancelled(cancel, fut))
            .catch_unwind()
            .await
    };

    match outcome {
        Ok(outcome) => settle(scope, outcome).await,
        Err(panic) => {
            if let Err(e) = scope.rollback().await {
                error!(error = %e, "Rollback after panic in unit of work failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

/// Commit on success; roll back on failure and keep both errors if that fails
pub async fn settle<S, T>(scope: S, outcome: Result<T, StoreError>) -> Result<T, StoreError>
where
    S: TxScope,
{
    match outcome {
        Ok(value) => match scope.commit().await {
            Ok(()) => {
                debug!("Transaction committed");
                Ok(value)
            }
            Err(e) => {
                error!(error = %e, "Commit failed");
                Err(StoreError::lifecycle(TxPhase::Commit, e))
            }
        },
        Err(work_err) => match scope.rollback().await {
            Ok(()) => {
                debug!(error = %work_err, "Transaction rolled back");
                Err(work_err)
            }
            Err(rb_err) => {
                error!(error = %work_err, rollback_error = %rb_err, "Rollback failed");
                Err(StoreError::composite(
                    work_err,
                    StoreError::lifecycle(TxPhase::Rollback, rb_err),
                ))
            }
        },
    }
}

/// Reject before opening a scope when the caller already gave up
pub fn ensure_live(cancel: &CancellationToken) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        warn!("Transaction not started: caller canceled");
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    work: TxFuture<'_, T>,
) -> Result<T, StoreError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!("Unit of work canceled while transaction open");
            Err(StoreError::Cancelled)
        }
        res = work => res,
    }
}

/// Child token that cancels itself once `timeout` elapses.
///
/// Cancel the returned token when the call finishes to stop its timer early.
pub fn with_deadline(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let timer = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    child
}
