//! Database layer errors.

use thiserror::Error;

use crate::client::ConnectionStringError;
use crate::storage::{InvalidNameError, StorageError};
use crate::transaction::TransactionError;

/// Result type for database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("invalid document id '{id}': {reason}")]
    InvalidId { id: String, reason: InvalidNameError },

    #[error(transparent)]
    InvalidConnectionString(#[from] ConnectionStringError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] serde_json::Error),
}

impl DatabaseError {
    /// The caller used the API wrongly (nested transaction, bad id, bad
    /// configuration). Retrying will not help.
    pub fn is_usage_error(&self) -> bool {
        match self {
            DatabaseError::Transaction(e) => e.is_usage_error(),
            DatabaseError::InvalidId { .. }
            | DatabaseError::InvalidConnectionString(_)
            | DatabaseError::InvalidConfig(_) => true,
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            DatabaseError::Storage(e) => e.is_transient(),
            DatabaseError::Transaction(e) => e.is_transient(),
            _ => false,
        }
    }
}
