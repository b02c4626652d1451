//! Storage layer for gitdoc.
//!
//! A complete abstraction over git for document storage. The client driver
//! uses this API and never touches git2 directly.
//!
//! # Layout
//!
//! ```text
//! _meta/store.json          store metadata (database name, format)
//! {collection}/{id}.json    one JSON blob per document
//! ```
//!
//! `main` holds committed state. Each session transaction writes to its own
//! `session/{id}` branch, which is fast-forwarded or replayed onto `main` on
//! commit and deleted on abort.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        GitStore                             │
//! │  (documents, session branches, commit/replay onto main)     │
//! └─────────────────────────────────────────────────────────────┘
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │    tree     │       │    blob     │       │    refs     │
//!  │(collections)│       │ (documents) │       │ (branches)  │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//!         └─────────────────────┼─────────────────────┘
//!                               ▼
//!                        ┌─────────────┐
//!                        │   commit    │
//!                        │  (history)  │
//!                        └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use gitdoc::storage::{CollectionName, DatabaseName, GitSignature, GitStore};
//!
//! let db = DatabaseName::new("shop")?;
//! let store = GitStore::open_or_init("./data/shop", &db, GitSignature::gitdoc(), true)?;
//!
//! let products = CollectionName::new("products")?;
//! store.insert_documents(&products, &[json!({"_id": "p1", "name": "Widget"})], None)?;
//!
//! let base = store.begin_session("01h...")?;
//! store.insert_documents(&products, &[json!({"_id": "p2"})], Some("01h..."))?;
//! store.commit_session("01h...", base)?;
//! ```

mod blob;
mod commit;
mod error;
mod refs;
mod store;
mod tree;
mod types;

pub use blob::{ID_FIELD, StoreMeta, document_id};
pub use commit::{CommitInfo, CommitMessage};
pub use error::{StorageError, StorageResult};
pub use store::{GitStore, SessionCommit, StoreStats};
pub use types::{
    BlobId, BranchName, Change, ChangeStatus, CollectionName, CommitId, DatabaseName,
    DocumentId, DocumentPath, GitSignature, InvalidNameError, TreeId,
};
