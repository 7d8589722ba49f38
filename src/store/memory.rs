//! In-memory Store
//!
//! Substitutable double for [`PgStore`](super::PgStore) with the properties the
//! transfer engine relies on:
//!
//! - writes inside a transaction stay private until commit
//! - a balance update takes the account's row lock and keeps it until the
//!   transaction commits or rolls back, so lock order matters as it does in
//!   PostgreSQL
//! - foreign key, unique and check constraints of the schema are enforced
//! - ids come from sequences that are not rolled back
//!
//! Any operation, and begin/commit/rollback, can be made to fail on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{ConstraintKind, StoreError, TxPhase};
use super::executor::{TxExecutor, TxFuture, TxScope, ensure_live, run_in_scope};
use super::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, CreateUserParams, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Transfer, User,
};
use super::querier::Querier;

/// Storage operation, as seen by fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Begin,
    Commit,
    Rollback,
    CreateAccount,
    GetAccount,
    ListAccounts,
    AddAccountBalance,
    CreateEntry,
    GetEntry,
    ListEntries,
    CreateTransfer,
    GetTransfer,
    ListTransfers,
    CreateUser,
    GetUser,
}

/// Committed row counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowCounts {
    pub users: usize,
    pub accounts: usize,
    pub entries: usize,
    pub transfers: usize,
}

#[derive(Debug)]
struct Fault {
    countdown: usize,
    persistent: bool,
}

#[derive(Default)]
struct Tables {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

struct Inner {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    faults: Mutex<HashMap<Op, Fault>>,
    calls: Mutex<HashMap<Op, usize>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        lock(&self.tables)
    }

    fn row_lock(&self, account_id: i64) -> Arc<AsyncMutex<()>> {
        lock(&self.row_locks)
            .entry(account_id)
            .or_default()
            .clone()
    }

    /// Count the call and fail it if a fault is armed
    fn hit(&self, op: Op) -> Result<(), StoreError> {
        *lock(&self.calls).entry(op).or_default() += 1;

        let mut faults = lock(&self.faults);
        let Some(fault) = faults.get_mut(&op) else {
            return Ok(());
        };
        if fault.countdown > 1 {
            fault.countdown -= 1;
            return Ok(());
        }
        if !fault.persistent {
            faults.remove(&op);
        }
        debug!(op = ?op, "Injected fault");
        Err(StoreError::Database {
            code: Some("XX000".to_string()),
            message: format!("injected fault on {:?}", op),
        })
    }

    fn next_id(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::SeqCst)
    }

    fn apply(&self, state: TxState) {
        let TxState {
            users,
            accounts,
            entries,
            transfers,
            deltas,
            locks,
        } = state;

        {
            let mut tables = self.tables();
            tables.users.extend(users);
            tables.accounts.extend(accounts);
            tables.entries.extend(entries);
            tables.transfers.extend(transfers);
            for (id, delta) in deltas {
                if let Some(account) = tables.accounts.get_mut(&id) {
                    account.balance += delta;
                }
            }
        }

        drop(locks);
    }
}

/// In-memory store; clones share the same data
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                account_seq: AtomicI64::new(1),
                entry_seq: AtomicI64::new(1),
                transfer_seq: AtomicI64::new(1),
                faults: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make the `nth` next call of `op` fail (1 = the very next one), once
    pub fn fail_on(&self, op: Op, nth: usize) {
        lock(&self.inner.faults).insert(
            op,
            Fault {
                countdown: nth.max(1),
                persistent: false,
            },
        );
    }

    /// Make every call of `op` fail until cleared
    pub fn fail_always(&self, op: Op) {
        lock(&self.inner.faults).insert(
            op,
            Fault {
                countdown: 1,
                persistent: true,
            },
        );
    }

    pub fn clear_faults(&self) {
        lock(&self.inner.faults).clear();
    }

    /// How many times `op` was attempted
    pub fn calls(&self, op: Op) -> usize {
        lock(&self.inner.calls).get(&op).copied().unwrap_or(0)
    }

    pub fn row_counts(&self) -> RowCounts {
        let tables = self.inner.tables();
        RowCounts {
            users: tables.users.len(),
            accounts: tables.accounts.len(),
            entries: tables.entries.len(),
            transfers: tables.transfers.len(),
        }
    }

    fn scope(&self) -> MemTx {
        MemTx {
            inner: self.inner.clone(),
            state: AsyncMutex::new(TxState::default()),
        }
    }
}

impl TxExecutor for MemStore {
    fn exec_tx<'a, T, F>(&'a self, cancel: &'a CancellationToken, work: F) -> TxFuture<'a, T>
    where
        T: Send + 'a,
        F: for<'q> FnOnce(&'q dyn Querier) -> TxFuture<'q, T> + Send + 'a,
    {
        Box::pin(async move {
            ensure_live(cancel)?;
            self.inner
                .hit(Op::Begin)
                .map_err(|e| StoreError::lifecycle(TxPhase::Begin, e))?;
            run_in_scope(self.scope(), cancel, work).await
        })
    }
}

// ============================================================
// TRANSACTION SCOPE
// ============================================================

/// Uncommitted writes and the row locks held by one transaction
#[derive(Default)]
struct TxState {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    deltas: HashMap<i64, i64>,
    locks: HashMap<i64, OwnedMutexGuard<()>>,
}

/// One open in-memory transaction. Dropping it discards its writes and
/// releases its row locks.
pub struct MemTx {
    inner: Arc<Inner>,
    state: AsyncMutex<TxState>,
}

fn foreign_key(table: &str, constraint: &str) -> StoreError {
    StoreError::Constraint {
        kind: ConstraintKind::ForeignKey,
        message: format!(
            "insert or update on table \"{}\" violates foreign key constraint \"{}\"",
            table, constraint
        ),
    }
}

fn unique(constraint: &str) -> StoreError {
    StoreError::Constraint {
        kind: ConstraintKind::Unique,
        message: format!(
            "duplicate key value violates unique constraint \"{}\"",
            constraint
        ),
    }
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

impl MemTx {
    /// Account as this transaction sees it: committed row plus own deltas
    fn visible_account(&self, state: &TxState, id: i64) -> Option<Account> {
        if let Some(account) = state.accounts.get(&id) {
            return Some(account.clone());
        }
        let tables = self.inner.tables();
        tables.accounts.get(&id).map(|account| {
            let mut account = account.clone();
            account.balance += state.deltas.get(&id).copied().unwrap_or(0);
            account
        })
    }

    fn account_exists(&self, state: &TxState, id: i64) -> bool {
        state.accounts.contains_key(&id) || self.inner.tables().accounts.contains_key(&id)
    }

    fn user_exists(&self, state: &TxState, username: &str) -> bool {
        state.users.contains_key(username) || self.inner.tables().users.contains_key(username)
    }

    async fn lock_row(&self, state: &mut TxState, id: i64) {
        if state.accounts.contains_key(&id) || state.locks.contains_key(&id) {
            return;
        }
        let row = self.inner.row_lock(id);
        let guard = row.lock_owned().await;
        state.locks.insert(id, guard);
    }

    /// Publish the writes, then release the row locks
    fn commit_unchecked(self) {
        let MemTx { inner, state } = self;
        inner.apply(state.into_inner());
    }
}

#[async_trait]
impl TxScope for MemTx {
    async fn commit(self) -> Result<(), StoreError> {
        // A failed commit leaves nothing behind, like an aborted transaction
        self.inner.hit(Op::Commit)?;
        self.commit_unchecked();
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        // Writes and locks go away with `self` either way
        self.inner.hit(Op::Rollback)
    }
}

#[async_trait]
impl Querier for MemTx {
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        self.inner.hit(Op::CreateAccount)?;

        if !self.user_exists(&state, &arg.owner) {
            return Err(foreign_key("accounts", "accounts_owner_fkey"));
        }
        let duplicate = |a: &Account| a.owner == arg.owner && a.currency == arg.currency;
        if state.accounts.values().any(duplicate)
            || self.inner.tables().accounts.values().any(duplicate)
        {
            return Err(unique("owner_currency_key"));
        }

        let account = Account {
            id: Inner::next_id(&self.inner.account_seq),
            owner: arg.owner,
            balance: arg.balance,
            currency: arg.currency,
            created_at: now(),
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::GetAccount)?;
        self.visible_account(&state, id).ok_or(StoreError::NotFound)
    }

    async fn get_account_for_update(&self, id: i64) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        self.inner.hit(Op::GetAccount)?;
        if !self.account_exists(&state, id) {
            return Err(StoreError::NotFound);
        }
        self.lock_row(&mut state, id).await;
        self.visible_account(&state, id).ok_or(StoreError::NotFound)
    }

    async fn list_accounts(
        &self,
        arg: ListAccountsParams<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::ListAccounts)?;
        let mut ids: Vec<i64> = self
            .inner
            .tables()
            .accounts
            .values()
            .chain(state.accounts.values())
            .filter(|a| a.owner == arg.owner)
            .map(|a| a.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        let accounts = ids
            .into_iter()
            .filter_map(|id| self.visible_account(&state, id));
        Ok(page(accounts, arg.limit, arg.offset))
    }

    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let mut state = self.state.lock().await;
        self.inner.hit(Op::AddAccountBalance)?;
        if !self.account_exists(&state, arg.id) {
            // UPDATE ... RETURNING matched no row
            return Err(StoreError::NotFound);
        }

        // Blocks while another transaction holds the row
        self.lock_row(&mut state, arg.id).await;

        let current = self
            .visible_account(&state, arg.id)
            .ok_or(StoreError::NotFound)?;
        let balance = current
            .balance
            .checked_add(arg.amount)
            .ok_or_else(|| StoreError::Database {
                code: Some("22003".to_string()),
                message: "bigint out of range".to_string(),
            })?;

        if let Some(pending) = state.accounts.get_mut(&arg.id) {
            pending.balance = balance;
        } else {
            *state.deltas.entry(arg.id).or_default() += arg.amount;
        }

        Ok(Account { balance, ..current })
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let mut state = self.state.lock().await;
        self.inner.hit(Op::CreateEntry)?;
        if !self.account_exists(&state, arg.account_id) {
            return Err(foreign_key("entries", "entries_account_id_fkey"));
        }

        let entry = Entry {
            id: Inner::next_id(&self.inner.entry_seq),
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: now(),
        };
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::GetEntry)?;
        if let Some(entry) = state.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.inner
            .tables()
            .entries
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::ListEntries)?;
        let tables = self.inner.tables();
        let mut entries: Vec<Entry> = tables
            .entries
            .values()
            .chain(state.entries.values())
            .filter(|e| e.account_id == arg.account_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(page(entries.into_iter(), arg.limit, arg.offset))
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        let mut state = self.state.lock().await;
        self.inner.hit(Op::CreateTransfer)?;
        if !self.account_exists(&state, arg.from_account_id) {
            return Err(foreign_key("transfers", "transfers_from_account_id_fkey"));
        }
        if !self.account_exists(&state, arg.to_account_id) {
            return Err(foreign_key("transfers", "transfers_to_account_id_fkey"));
        }
        if arg.amount <= 0 {
            return Err(StoreError::Constraint {
                kind: ConstraintKind::Check,
                message: "new row for relation \"transfers\" violates check constraint \
                          \"transfers_amount_check\""
                    .to_string(),
            });
        }

        let transfer = Transfer {
            id: Inner::next_id(&self.inner.transfer_seq),
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: now(),
        };
        state.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::GetTransfer)?;
        if let Some(transfer) = state.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.inner
            .tables()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn list_transfers(
        &self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::ListTransfers)?;
        let tables = self.inner.tables();
        let mut transfers: Vec<Transfer> = tables
            .transfers
            .values()
            .chain(state.transfers.values())
            .filter(|t| {
                t.from_account_id == arg.from_account_id || t.to_account_id == arg.to_account_id
            })
            .cloned()
            .collect();
        transfers.sort_by_key(|t| t.id);
        Ok(page(transfers.into_iter(), arg.limit, arg.offset))
    }

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        let mut state = self.state.lock().await;
        self.inner.hit(Op::CreateUser)?;
        if self.user_exists(&state, &arg.username) {
            return Err(unique("users_pkey"));
        }
        let same_email = |u: &User| u.email == arg.email;
        if state.users.values().any(same_email) || self.inner.tables().users.values().any(same_email)
        {
            return Err(unique("users_email_key"));
        }

        let user = User {
            username: arg.username,
            hashed_password: arg.hashed_password,
            full_name: arg.full_name,
            email: arg.email,
            password_changed_at: DateTime::<Utc>::MIN_UTC,
            created_at: now(),
        };
        state.users.insert(user.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        let state = self.state.lock().await;
        self.inner.hit(Op::GetUser)?;
        if let Some(user) = state.users.get(username) {
            return Ok(user.clone());
        }
        self.inner
            .tables()
            .users
            .get(username)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
}

// ============================================================
// AUTOCOMMIT
// ============================================================

// Each call runs in its own scope; writes publish immediately and are not
// subject to injected commit faults.
#[async_trait]
impl Querier for MemStore {
    async fn create_account(&self, arg: CreateAccountParams) -> Result<Account, StoreError> {
        let tx = self.scope();
        let account = tx.create_account(arg).await?;
        tx.commit_unchecked();
        Ok(account)
    }

    async fn get_account(&self, id: i64) -> Result<Account, StoreError> {
        self.scope().get_account(id).await
    }

    async fn get_account_for_update(&self, id: i64) -> Result<Account, StoreError> {
        self.scope().get_account_for_update(id).await
    }

    async fn list_accounts(
        &self,
        arg: ListAccountsParams<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        self.scope().list_accounts(arg).await
    }

    async fn add_account_balance(
        &self,
        arg: AddAccountBalanceParams,
    ) -> Result<Account, StoreError> {
        let tx = self.scope();
        let account = tx.add_account_balance(arg).await?;
        tx.commit_unchecked();
        Ok(account)
    }

    async fn create_entry(&self, arg: CreateEntryParams) -> Result<Entry, StoreError> {
        let tx = self.scope();
        let entry = tx.create_entry(arg).await?;
        tx.commit_unchecked();
        Ok(entry)
    }

    async fn get_entry(&self, id: i64) -> Result<Entry, StoreError> {
        self.scope().get_entry(id).await
    }

    async fn list_entries(&self, arg: ListEntriesParams) -> Result<Vec<Entry>, StoreError> {
        self.scope().list_entries(arg).await
    }

    async fn create_transfer(&self, arg: CreateTransferParams) -> Result<Transfer, StoreError> {
        let tx = self.scope();
        let transfer = tx.create_transfer(arg).await?;
        tx.commit_unchecked();
        Ok(transfer)
    }

    async fn get_transfer(&self, id: i64) -> Result<Transfer, StoreError> {
        self.scope().get_transfer(id).await
    }

    async fn list_transfers(
        &self,
        arg: ListTransfersParams,
    ) -> Result<Vec<Transfer>, StoreError> {
        self.scope().list_transfers(arg).await
    }

    async fn create_user(&self, arg: CreateUserParams) -> Result<User, StoreError> {
        let tx = self.scope();
        let user = tx.create_user(arg).await?;
        tx.commit_unchecked();
        Ok(user)
    }

    async fn get_user(&self, username: &str) -> Result<User, StoreError> {
        self.scope().get_user(username).await
    }
}
