//! Single-row query capability
//!
//! Every operation is one statement at the storage layer. The same trait is
//! served by a pool (autocommit) and by an open transaction, so units of work
//! are written once against `&dyn Querier`.

use async_trait::async_trait;

use super::error::StoreError;
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, User,
};

#[async_trait]
pub trait Querier: Send + Sync {
    // === Accounts ===

    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError>;

    /// `StoreError::NotFound` when the id does not exist
    async fn get_account(&self, id: i64) -> Result<Account, StoreError>;

    /// Read and row-lock the account until the enclosing transaction ends
    async fn get_account_for_update(&self, id: i64) -> Result<Account, StoreError>;

    async fn list_accounts(&self, arg: ListAccountsParams<'_>)
    -> Result<Vec<Account>, StoreError>;

    /// Atomic `balance = balance + amount`, returning the updated row.
    /// Never a read followed by a write.
    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError>;

    // === Entries (append-only) ===

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError>;

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError>;

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError>;

    // === Transfers (append-only) ===

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError>;

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError>;

    async fn list_transfers(&self, arg: ListTransfersParams)
    -> Result<Vec<Transfer>, StoreError>;

    // === Users ===

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError>;

    async fn get_user(&self, username: &str) -> Result<User, StoreError>;
}
