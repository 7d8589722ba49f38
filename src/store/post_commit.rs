//! Transactional writes followed by a post-commit effect
//!
//! The effect (enqueueing a job, notifying another subsystem) runs only after
//! the commit succeeded. Its failure is reported next to the committed value
//! and never undoes the write.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::StoreError;
use super::executor::{TxExecutor, TxFuture};
use super::models::{CreateUserParams, User};
use super::querier::Querier;

/// Boxed effect over the committed value, for object-safe callers
pub type PostCommit<T> =
    Box<dyn for<'v> FnOnce(&'v T) -> BoxFuture<'v, anyhow::Result<()>> + Send + 'static>;

/// A durable write plus the outcome of its post-commit effect
#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    /// `Some` when the effect failed; the write is committed regardless
    pub effect_error: Option<anyhow::Error>,
}

impl<T> Committed<T> {
    pub fn effect_succeeded(&self) -> bool {
        self.effect_error.is_none()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Run `work` in one transaction, then `post_commit` on its committed result.
pub async fn run_tx<'a, E, T, F, P>(
    executor: &'a E,
    cancel: &'a CancellationToken,
    work: F,
    post_commit: P,
) -> Result<Committed<T>, StoreError>
where
    E: TxExecutor,
    T: Send + 'a,
    F: for<'q> FnOnce(&'q dyn Querier) -> TxFuture<'q, T> + Send + 'a,
    P: for<'v> FnOnce(&'v T) -> BoxFuture<'v, anyhow::Result<()>> + Send + 'a,
{
    let value = executor.exec_tx(cancel, work).await?;

    let effect_error = match post_commit(&value).await {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, "Post-commit effect failed; write stays committed");
            Some(e)
        }
    };

    Ok(Committed {
        value,
        effect_error,
    })
}

/// Payload of the job enqueued once a user exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailPayload {
    pub username: String,
}

/// Background job dispatch seen from the store
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute_send_verify_email(&self, payload: VerifyEmailPayload)
    -> anyhow::Result<()>;
}

/// Insert a user, then run `after_create` once the insert is durable
pub async fn create_user_tx<'a, E>(
    executor: &'a E,
    cancel: &'a CancellationToken,
    arg: CreateUserParams,
    after_create: PostCommit<User>,
) -> Result<Committed<User>, StoreError>
where
    E: TxExecutor,
{
    let committed = run_tx(
        executor,
        cancel,
        move |q| Box::pin(async move { q.create_user(arg).await }),
        after_create,
    )
    .await?;

    info!(
        username = %committed.value.username,
        effect_ok = committed.effect_succeeded(),
        "User created"
    );
    Ok(committed)
}

/// Box a post-commit closure, fixing its higher-ranked signature
pub fn post_commit<T, F>(effect: F) -> PostCommit<T>
where
    F: for<'v> FnOnce(&'v T) -> BoxFuture<'v, anyhow::Result<()>> + Send + 'static,
{
    Box::new(effect)
}

/// Post-commit effect that does nothing
pub fn no_effect<T>() -> PostCommit<T> {
    post_commit(|_| Box::pin(async { Ok(()) }))
}

/// `after_create` effect that enqueues the verify-email job
pub fn send_verify_email<D>(distributor: D) -> PostCommit<User>
where
    D: TaskDistributor + 'static,
{
    post_commit(move |user: &User| {
        let payload = VerifyEmailPayload {
            username: user.username.clone(),
        };
        Box::pin(async move { distributor.distribute_send_verify_email(payload).await })
    })
}
