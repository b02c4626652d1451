//! Ambient transactions.
//!
//! A transaction is a client session with a transaction in progress, which in
//! the store means a `session/{id}` branch. This module makes that session
//! ambient: once published into the [`SessionContext`] of a call chain, every
//! repository operation on that chain joins it without the session being
//! passed around.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Transaction                          │
//! │      (commit with retry / abort / drop, completes once)     │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//!  ┌──────────────────────────┐     ┌──────────────────────────┐
//!  │      SessionContext      │     │       RetryPolicy        │
//!  │   (task-local session)   │     │    (linear backoff)      │
//!  └──────────────────────────┘     └──────────────────────────┘
//! ```
//!
//! Transactions are started through `DbContext::start_transaction`, which
//! refuses to nest them.

mod ambient;
mod error;
mod handle;
mod retry;

pub use ambient::SessionContext;
pub use error::{TransactionError, TransactionResult};
pub use handle::{Transaction, TransactionOutcome};
pub use retry::{RetryPolicy, RetryableError};
