//! High-level database API.
//!
//! [`DbContext`] opens a database and starts ambient transactions;
//! [`Repository`] gives typed CRUD over one collection and transparently joins
//! the ambient transaction of the calling chain.

mod config;
mod context;
mod error;
mod repository;
mod settings;

pub use config::DbConfig;
pub use context::DbContext;
pub use error::{DatabaseError, DatabaseResult};
pub use repository::{Document, DocumentRepository, Repository};
pub use settings::{GitDocSettings, Settings};
