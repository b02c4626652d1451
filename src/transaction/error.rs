//! Transaction error types.

use thiserror::Error;

use crate::storage::StorageError;
use crate::transaction::retry::RetryableError;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur while starting, committing or aborting a transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A transaction is already active on this call chain. Nested
    /// transactions are not supported.
    #[error("a transaction is already in progress; nested transactions are not supported")]
    AlreadyInProgress,

    /// The caller is not inside a [`SessionContext::scope`](crate::transaction::SessionContext::scope).
    #[error("no session scope on this task; wrap the call chain in SessionContext::scope")]
    NoSessionScope,

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Cancelled through the caller's cancellation token.
    #[error("transaction {session_id} was cancelled")]
    Cancelled { session_id: String },

    /// The commit did not finish within `max_commit_time`.
    #[error("transaction {session_id} commit timed out after {elapsed_ms}ms")]
    Timeout { session_id: String, elapsed_ms: u64 },
}

impl TransactionError {
    /// Misuse of the API rather than a store failure.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            TransactionError::AlreadyInProgress | TransactionError::NoSessionScope
        )
    }

    /// A transient store failure; the retried operation may still succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransactionError::Storage(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl RetryableError for TransactionError {
    fn is_transient(&self) -> bool {
        TransactionError::is_transient(self)
    }
}
