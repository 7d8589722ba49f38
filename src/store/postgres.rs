//! PostgreSQL Store
//!
//! `PgStore` serves single-row queries straight from the pool (autocommit) and
//! opens `PgTx` scopes for units of work. Both run the same statements below.
//!
//! Balance changes are a single `UPDATE ... SET balance = balance + $2
//! RETURNING ...`, so the row lock taken by the update is held until the
//! enclosing transaction ends.

use async_trait::async_trait;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::error::{StoreError, TxPhase};
use super::executor::{TxExecutor, TxFuture, TxScope, ensure_live, run_in_scope};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, User,
};
use super::querier::Querier;

/// Production store over a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, cancel: &CancellationToken) -> Result<PgTx, StoreError> {
        ensure_live(cancel)?;
        let tx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            tx = self.pool.begin() => tx,
        };
        let tx = tx.map_err(|e| StoreError::lifecycle(TxPhase::Begin, e.into()))?;
        Ok(PgTx::new(tx))
    }
}

impl TxExecutor for PgStore {
    fn exec_tx<'a, T, F>(&'a self, cancel: &'a CancellationToken, work: F) -> TxFuture<'a, T>
    where
        T: Send + 'a,
        F: for<'q> FnOnce(&'q dyn Querier) -> TxFuture<'q, T> + Send + 'a,
    {
        Box::pin(async move {
            let tx = self.begin(cancel).await?;
            run_in_scope(tx, cancel, work).await
        })
    }
}

/// Querier bound to one open PostgreSQL transaction.
///
/// Dropping it without commit rolls the transaction back when the connection
/// returns to the pool.
pub struct PgTx {
    tx: Mutex<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

#[async_trait]
impl TxScope for PgTx {
    async fn commit(self) -> Result<(), StoreError> {
        self.tx.into_inner().commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.into_inner().rollback().await?;
        Ok(())
    }
}

// ============================================================
// STATEMENTS
// ============================================================

mod sql {
    use super::*;

    pub async fn create_account<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateAccountParams,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING id, owner, balance, currency, created_at",
        )
        .bind(arg.owner)
        .bind(arg.balance)
        .bind(arg.currency)
        .fetch_one(exec)
        .await?;
        Ok(account)
    }

    pub async fn get_account<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_one(exec)
        .await?;
        Ok(account)
    }

    pub async fn get_account_for_update<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
    ) -> Result<Account, StoreError> {
        // NO KEY UPDATE leaves FOR KEY SHARE (taken by entry/transfer foreign keys) compatible
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE",
        )
        .bind(id)
        .fetch_one(exec)
        .await?;
        Ok(account)
    }

    pub async fn list_accounts<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: ListAccountsParams<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        let accounts = sqlx::query_as::<_, Account>(
            "SELECT id, owner, balance, currency, created_at FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3",
        )
        .bind(arg.owner)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(exec)
        .await?;
        Ok(accounts)
    }

    pub async fn add_account_balance<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING id, owner, balance, currency, created_at",
        )
        .bind(arg.id)
        .bind(arg.amount)
        .fetch_one(exec)
        .await?;
        Ok(account)
    }

    pub async fn create_entry<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateEntryParams,
    ) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) \
             RETURNING id, account_id, amount, created_at",
        )
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(exec)
        .await?;
        Ok(entry)
    }

    pub async fn get_entry<'e, E: PgExecutor<'e>>(exec: E, id: i64) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_one(exec)
        .await?;
        Ok(entry)
    }

    pub async fn list_entries<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: ListEntriesParams,
    ) -> Result<Vec<Entry>, StoreError> {
        let entries = sqlx::query_as::<_, Entry>(
            "SELECT id, account_id, amount, created_at FROM entries \
             WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
        )
        .bind(arg.account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(exec)
        .await?;
        Ok(entries)
    }

    pub async fn create_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateTransferParams,
    ) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
             RETURNING id, from_account_id, to_account_id, amount, created_at",
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount)
        .fetch_one(exec)
        .await?;
        Ok(transfer)
    }

    pub async fn get_transfer<'e, E: PgExecutor<'e>>(
        exec: E,
        id: i64,
    ) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(
            "SELECT id, from_account_id, to_account_id, amount, created_at \
             FROM transfers WHERE id = $1 LIMIT 1",
        )
        .bind(id)
        .fetch_one(exec)
        .await?;
        Ok(transfer)
    }

    pub async fn list_transfers<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let transfers = sqlx::query_as::<_, Transfer>(
            "SELECT id, from_account_id, to_account_id, amount, created_at FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4",
        )
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.limit)
        .bind(arg.offset)
        .fetch_all(exec)
        .await?;
        Ok(transfers)
    }

    pub async fn create_user<'e, E: PgExecutor<'e>>(
        exec: E,
        arg: CreateUserParams,
    ) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4) \
             RETURNING username, hashed_password, full_name, email, password_changed_at, created_at",
        )
        .bind(arg.username)
        .bind(arg.hashed_password)
        .bind(arg.full_name)
        .bind(arg.email)
        .fetch_one(exec)
        .await?;
        Ok(user)
    }

    pub async fn get_user<'e, E: PgExecutor<'e>>(
        exec: E,
        username: &str,
    ) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(
            "SELECT username, hashed_password, full_name, email, password_changed_at, created_at \
             FROM users WHERE username = $1 LIMIT 1",
        )
        .bind(username)
        .fetch_one(exec)
        .await?;
        Ok(user)
    }
}

// ============================================================
// POOL (autocommit)
// ============================================================

#[async_trait]
impl Querier for PgStore {
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        sql::create_account(&self.pool, arg).await
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        sql::get_account(&self.pool, id).await
    }

    async fn get_account_for_update(&self, id: i64) -> Result<Account, StoreError> {
        sql::get_account_for_update(&self.pool, id).await
    }

    async fn list_accounts(
        &self,
        arg: ListAccountsParams<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        sql::list_accounts(&self.pool, arg).await
    }

    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        sql::add_account_balance(&self.pool, arg).await
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        sql::create_entry(&self.pool, arg).await
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        sql::get_entry(&self.pool, id).await
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        sql::list_entries(&self.pool, arg).await
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        sql::create_transfer(&self.pool, arg).await
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        sql::get_transfer(&self.pool, id).await
    }

    async fn list_transfers(
        &self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        sql::list_transfers(&self.pool, arg).await
    }

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        sql::create_user(&self.pool, arg).await
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        sql::get_user(&self.pool, username).await
    }
}

// ============================================================
// TRANSACTION SCOPE
// ============================================================

// The guard temporary lives until the end of each statement, so the
// connection stays exclusively borrowed across the await.
#[async_trait]
impl Querier for PgTx {
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        sql::create_account(&mut **self.tx.lock().await, arg).await
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        sql::get_account(&mut **self.tx.lock().await, id).await
    }

    async fn get_account_for_update(&self, id: i64) -> Result<Account, StoreError> {
        sql::get_account_for_update(&mut **self.tx.lock().await, id).await
    }

    async fn list_accounts(
        &self,
        arg: ListAccountsParams<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        sql::list_accounts(&mut **self.tx.lock().await, arg).await
    }

    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        sql::add_account_balance(&mut **self.tx.lock().await, arg).await
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        sql::create_entry(&mut **self.tx.lock().await, arg).await
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        sql::get_entry(&mut **self.tx.lock().await, id).await
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        sql::list_entries(&mut **self.tx.lock().await, arg).await
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        sql::create_transfer(&mut **self.tx.lock().await, arg).await
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        sql::get_transfer(&mut **self.tx.lock().await, id).await
    }

    async fn list_transfers(
        &self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        sql::list_transfers(&mut **self.tx.lock().await, arg).await
    }

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        sql::create_user(&mut **self.tx.lock().await, arg).await
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        sql::get_user(&mut **self.tx.lock().await, username).await
    }
}
