//! Storage layer error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::{CollectionName, DocumentId, InvalidNameError};

/// Errors raised by the git-backed store and the client driver on top of it.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// Duplicate `_id` within a collection.
    #[error("document already exists: collection={collection}, id={id}")]
    DocumentAlreadyExists {
        collection: CollectionName,
        id: DocumentId,
    },

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The document did not serialize to a JSON object with a string `_id`.
    #[error("document has no string `_id` field")]
    MissingDocumentId,

    #[error("ref not found: {0}")]
    RefNotFound(String),

    /// Both the session and `main` changed the same documents since the
    /// session's transaction began.
    #[error("write conflict on: {}", paths_display(.conflicting_paths))]
    MergeConflict { conflicting_paths: Vec<PathBuf> },

    #[error("corrupted data at {path}: {reason}")]
    CorruptedData { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store not initialized: {0}")]
    NotInitialized(PathBuf),

    #[error("store is empty: no commits found")]
    EmptyRepository,

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    #[error("unexpected entry type at {path}: expected {expected}, found {found}")]
    UnexpectedEntryType {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("branch already exists: {0}")]
    BranchAlreadyExists(String),

    /// A compare-and-swap on a branch lost against another writer.
    #[error("concurrent modification: branch {branch} was updated by another writer")]
    ConcurrentModification { branch: String },

    #[error("session {session_id} has ended")]
    SessionEnded { session_id: String },

    #[error("session {session_id} has no transaction in progress")]
    NoTransactionInProgress { session_id: String },

    #[error("session {session_id} already has a transaction in progress")]
    TransactionInProgress { session_id: String },

    #[error("store belongs to database '{found}', expected '{expected}'")]
    DatabaseMismatch { expected: String, found: String },

    /// A blocking store task panicked or was cancelled by the runtime.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Internal(String),
}

fn paths_display(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl StorageError {
    /// True for failures that may succeed when the whole operation is re-run.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::ConcurrentModification { .. } => true,
            StorageError::Git(e) => e.code() == git2::ErrorCode::Locked,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::DocumentAlreadyExists { .. }
                | StorageError::MergeConflict { .. }
                | StorageError::ConcurrentModification { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
