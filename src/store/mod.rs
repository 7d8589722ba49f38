//! Ledger Store
//!
//! Transfers, entries and accounts on a relational store, with a transactional
//! transfer engine on top.
//!
//! # Capabilities
//!
//! - [`Querier`]: single-row statements (create/read account, create entry,
//!   create transfer, add a signed delta to a balance, ...)
//! - [`TxExecutor`]: run a unit of work inside one transaction scope
//! - [`Store`]: `Querier` plus the transactional operations (`transfer_tx`,
//!   `create_user_tx`), implemented once for every adapter that has the two
//!   capabilities above
//!
//! Adapters: [`PgStore`] (PostgreSQL) and, with the `mem-store` feature,
//! [`MemStore`] (in-memory double with row locks and fault injection).
//!
//! # Safety Invariants
//!
//! 1. **Conservation**: a transfer of `A` writes exactly one `-A` and one `+A` entry
//! 2. **All-or-nothing**: the transfer row, both entries and both balance
//!    updates commit together or not at all
//! 3. **Lock order**: balances are updated smaller account id first, by every caller
//! 4. **Append-only**: no statement updates or deletes entries or transfers

pub mod error;
pub mod executor;
#[cfg(feature = "mem-store")]
pub mod memory;
pub mod models;
pub mod ordering;
pub mod post_commit;
pub mod postgres;
pub mod querier;
pub mod transfer;

#[cfg(all(test, feature = "mem-store"))]
mod integration_tests;

// Re-exports for convenience
pub use error::{ConstraintKind, ErrorClass, StoreError, TxPhase};
pub use executor::{TxExecutor, TxFuture, TxScope, with_deadline};
#[cfg(feature = "mem-store")]
pub use memory::{MemStore, Op};
pub use models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, User,
};
pub use ordering::{UpdateOrder, update_order};
pub use post_commit::{
    Committed, PostCommit, TaskDistributor, VerifyEmailPayload, no_effect, post_commit, run_tx,
    send_verify_email,
};
pub use postgres::PgStore;
pub use querier::Querier;
pub use transfer::{TransferTxParams, TransferTxResult};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Everything API-layer collaborators need from storage
///
/// `Store` stays object safe (`Arc<dyn Store>`), so it has no generic
/// methods. Custom units of work go through [`run_tx`] or
/// [`TxExecutor::exec_tx`], which need the concrete adapter: collaborators
/// that run their own transactions depend on `S: Store + TxExecutor` instead.
#[async_trait]
pub trait Store: Querier {
    /// Move `arg.amount` from `arg.from_account_id` to `arg.to_account_id`
    async fn transfer_tx(
        &self,
        cancel: &CancellationToken,
        arg: TransferTxParams,
    ) -> Result<TransferTxResult, StoreError>;

    /// Insert a user, then run `after_create` once the insert is committed
    async fn create_user_tx(
        &self,
        cancel: &CancellationToken,
        arg: CreateUserParams,
        after_create: PostCommit<User>,
    ) -> Result<Committed<User>, StoreError>;
}

#[async_trait]
impl<S> Store for S
where
    S: Querier + TxExecutor,
{
    async fn transfer_tx(
        &self,
        cancel: &CancellationToken,
        arg: TransferTxParams,
    ) -> Result<TransferTxResult, StoreError> {
        transfer::transfer_tx(self, cancel, arg).await
    }

    async fn create_user_tx(
        &self,
        cancel: &CancellationToken,
        arg: CreateUserParams,
        after_create: PostCommit<User>,
    ) -> Result<Committed<User>, StoreError> {
        post_commit::create_user_tx(self, cancel, arg, after_create).await
    }
}
