//! Bank Ledger - Transactional Transfer Engine
//!
//! Double-entry ledger of accounts, entries and transfers on PostgreSQL.
//!
//! # Modules
//!
//! - [`store`] - Querier, transaction executor, transfer and post-commit operations
//! - [`db`] - Connection pool and schema
//! - [`config`] - YAML application config
//! - [`logging`] - tracing setup
//! - [`currency`] - Supported currency codes
//! - [`random`] - Random fixtures for tests and seeding

pub mod config;
pub mod currency;
pub mod db;
pub mod logging;
pub mod random;
pub mod store;

// Convenient re-exports at crate root
pub use config::{AppConfig, DatabaseConfig};
pub use db::Database;
#[cfg(feature = "mem-store")]
pub use store::MemStore;
pub use store::{
    Account, Committed, Entry, PgStore, Querier, Store, StoreError, Transfer, TransferTxParams,
    TransferTxResult, TxExecutor, User,
};
