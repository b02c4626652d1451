//! GitDoc - a Git-backed document database with ambient transactions.
//!
//! Documents are JSON blobs under `{collection}/{id}.json` in a git
//! repository. Committed state lives on `main`; every transaction writes to
//! its own `session/{id}` branch, which is replayed onto `main` on commit.
//!
//! # Example
//!
//! ```no_run
//! use gitdoc::db::{DbContext, Document, DocumentRepository, Repository};
//! use gitdoc::transaction::SessionContext;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Product {
//!     #[serde(rename = "_id")]
//!     id: String,
//!     name: String,
//! }
//!
//! impl Document for Product {
//!     const COLLECTION: &'static str = "products";
//! }
//!
//! # async fn run() -> gitdoc::db::DatabaseResult<()> {
//! let ctx = DbContext::open("gitdoc:///var/lib/gitdoc/shop").await?;
//! let products = Repository::<Product>::new(&ctx)?;
//!
//! SessionContext::scope(async {
//!     let tx = ctx.start_transaction(None, None).await?;
//!     products
//!         .insert(&Product { id: "p1".into(), name: "Widget".into() })
//!         .await?;
//!     tx.commit().await?;
//!     Ok::<_, gitdoc::db::DatabaseError>(())
//! })
//! .await
//! # }
//! ```

pub mod client;
pub mod db;
pub mod storage;
pub mod transaction;

pub use client::{Client, ClientSession, ConnectionString};
pub use db::{DatabaseError, DatabaseResult, DbContext, Document, DocumentRepository, Repository};
pub use transaction::{RetryPolicy, SessionContext, Transaction, TransactionError, TransactionOutcome};
