//! Store Error Types
//!
//! One error type for every storage call and every transactional unit of work.
//! [`StoreError::class`] folds the variants onto the four failure classes the
//! API layer distinguishes.

use std::fmt;
use thiserror::Error;

/// PostgreSQL SQLSTATE codes the store classifies
pub mod sqlstate {
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const QUERY_CANCELED: &str = "57014";
}

/// Integrity constraint rejected by the storage layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    NotNull,
    ForeignKey,
    Unique,
    Check,
}

impl ConstraintKind {
    pub fn from_sqlstate(code: &str) -> Option<Self> {
        match code {
            sqlstate::NOT_NULL_VIOLATION => Some(ConstraintKind::NotNull),
            sqlstate::FOREIGN_KEY_VIOLATION => Some(ConstraintKind::ForeignKey),
            sqlstate::UNIQUE_VIOLATION => Some(ConstraintKind::Unique),
            sqlstate::CHECK_VIOLATION => Some(ConstraintKind::Check),
            _ => None,
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            ConstraintKind::NotNull => sqlstate::NOT_NULL_VIOLATION,
            ConstraintKind::ForeignKey => sqlstate::FOREIGN_KEY_VIOLATION,
            ConstraintKind::Unique => sqlstate::UNIQUE_VIOLATION,
            ConstraintKind::Check => sqlstate::CHECK_VIOLATION,
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConstraintKind::NotNull => "not-null",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::Unique => "unique",
            ConstraintKind::Check => "check",
        };
        f.write_str(name)
    }
}

/// Transaction lifecycle step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxPhase {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxPhase::Begin => "begin",
            TxPhase::Commit => "commit",
            TxPhase::Rollback => "roll back",
        };
        f.write_str(name)
    }
}

/// Failure class reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Begin, commit or rollback of the transaction scope failed
    Lifecycle,
    /// Work failed and the rollback failed too
    Composite,
    /// Storage-layer integrity rejection
    Constraint,
    /// A step inside the unit of work failed; the transaction was rolled back
    Work,
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("{kind} violation: {message}")]
    Constraint {
        kind: ConstraintKind,
        message: String,
    },

    #[error("database error: {message}")]
    Database {
        code: Option<String>,
        message: String,
    },

    /// Unit of work gave up on its own terms
    #[error("unit of work aborted: {0}")]
    Aborted(String),

    #[error("transaction canceled")]
    Cancelled,

    #[error("failed to {phase} transaction: {source}")]
    Lifecycle {
        phase: TxPhase,
        #[source]
        source: Box<StoreError>,
    },

    /// Work failure and rollback failure, both kept
    #[error("tx err: {work}, rb err: {rollback}")]
    Composite {
        #[source]
        work: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    pub fn lifecycle(phase: TxPhase, source: StoreError) -> Self {
        StoreError::Lifecycle {
            phase,
            source: Box::new(source),
        }
    }

    pub fn composite(work: StoreError, rollback: StoreError) -> Self {
        StoreError::Composite {
            work: Box::new(work),
            rollback: Box::new(rollback),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Lifecycle { .. } => ErrorClass::Lifecycle,
            StoreError::Composite { .. } => ErrorClass::Composite,
            StoreError::Constraint { .. } => ErrorClass::Constraint,
            StoreError::NotFound
            | StoreError::Database { .. }
            | StoreError::Aborted(_)
            | StoreError::Cancelled => ErrorClass::Work,
        }
    }

    /// The SQLSTATE behind this error, when the storage layer reported one
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            StoreError::Constraint { kind, .. } => Some(kind.sqlstate()),
            StoreError::Database { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Serialization conflicts and detected deadlocks may succeed if the
    /// caller runs the whole operation again. The engine never does.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.sqlstate(),
            Some(sqlstate::SERIALIZATION_FAILURE | sqlstate::DEADLOCK_DETECTED)
        )
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound => "NOT_FOUND",
            StoreError::Constraint { kind, .. } => match kind {
                ConstraintKind::NotNull => "NOT_NULL_VIOLATION",
                ConstraintKind::ForeignKey => "FOREIGN_KEY_VIOLATION",
                ConstraintKind::Unique => "UNIQUE_VIOLATION",
                ConstraintKind::Check => "CHECK_VIOLATION",
            },
            StoreError::Database { .. } if self.is_retryable() => "CONFLICT",
            StoreError::Database { .. } => "DATABASE_ERROR",
            StoreError::Aborted(_) => "ABORTED",
            StoreError::Cancelled => "CANCELED",
            StoreError::Lifecycle { .. } => "TRANSACTION_ERROR",
            StoreError::Composite { .. } => "ROLLBACK_FAILED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::NotFound => 404,
            StoreError::Constraint {
                kind: ConstraintKind::ForeignKey | ConstraintKind::Unique,
                ..
            } => 403,
            StoreError::Constraint { .. } => 400,
            StoreError::Database { .. } if self.is_retryable() => 409,
            StoreError::Aborted(_) => 422,
            StoreError::Cancelled => 408,
            StoreError::Database { .. }
            | StoreError::Lifecycle { .. }
            | StoreError::Composite { .. } => 500,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned());
                let message = db.message().to_string();
                match code.as_deref().and_then(ConstraintKind::from_sqlstate) {
                    Some(kind) => StoreError::Constraint { kind, message },
                    None => StoreError::Database { code, message },
                }
            }
            _ => StoreError::Database {
                code: None,
                message: e.to_string(),
            },
        }
    }
}
