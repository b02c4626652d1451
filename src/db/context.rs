//! The database context: client, database handle and transaction factory.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::client::{Client, Collection, Database, SessionOptions, TransactionOptions};
use crate::db::config::DbConfig;
use crate::db::error::DatabaseResult;
use crate::storage::DatabaseName;
use crate::transaction::{
    RetryPolicy, SessionContext, Transaction, TransactionError, TransactionResult,
};

/// Owns the client and database handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DbContext {
    inner: Arc<DbContextInner>,
}

#[derive(Debug)]
struct DbContextInner {
    client: Client,
    database: Database,
    config: DbConfig,
}

impl DbContext {
    /// Open a database from a `gitdoc://` connection string.
    pub async fn open(connection_string: &str) -> DatabaseResult<Self> {
        Self::open_with_config(DbConfig::from_connection_string(connection_string)?).await
    }

    pub async fn open_with_config(config: DbConfig) -> DatabaseResult<Self> {
        let client = Client::connect(&config.connection_string()).await?;
        Ok(Self::from_client(client, config))
    }

    pub(crate) fn from_client(client: Client, config: DbConfig) -> Self {
        let database = client.database();
        Self {
            inner: Arc::new(DbContextInner {
                client,
                database,
                config,
            }),
        }
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn database_name(&self) -> &DatabaseName {
        self.inner.database.name()
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.config.retry
    }

    pub fn collection<T>(&self, name: &str) -> DatabaseResult<Collection<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        Ok(self.inner.database.collection(name)?)
    }

    /// Start a transaction and make it the ambient session of this call chain.
    ///
    /// Must run inside [`SessionContext::scope`]. Fails with
    /// [`TransactionError::AlreadyInProgress`] if the chain already has an
    /// active transaction, which is left untouched.
    pub async fn start_transaction(
        &self,
        session_options: Option<SessionOptions>,
        transaction_options: Option<TransactionOptions>,
    ) -> TransactionResult<Transaction> {
        if !SessionContext::in_scope() {
            return Err(TransactionError::NoSessionScope);
        }
        if SessionContext::current().is_some() {
            return Err(TransactionError::AlreadyInProgress);
        }

        let session = self.inner.client.start_session(session_options);
        if let Err(e) = session.start_transaction(transaction_options).await {
            session.end_session();
            return Err(e.into());
        }

        if let Err(e) = SessionContext::publish(&session) {
            session.end_session();
            return Err(e);
        }

        let session_id = session.id().to_string();
        debug!(session_id = %session_id, "ambient transaction started");

        Ok(Transaction::new(
            session,
            self.retry_policy(),
            move |outcome| {
                SessionContext::clear_if(&session_id);
                debug!(session_id = %session_id, %outcome, "ambient transaction cleared");
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn context() -> (TempDir, DbContext) {
        let dir = TempDir::new().unwrap();
        let config = DbConfig::new(dir.path(), "shop").unwrap();
        let ctx = DbContext::open_with_config(config).await.unwrap();
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_open_from_connection_string() {
        let dir = TempDir::new().unwrap();
        let conn = format!("gitdoc://{}/shop?maxCommitRetries=2", dir.path().display());

        let ctx = DbContext::open(&conn).await.unwrap();
        assert_eq!(ctx.database_name().as_str(), "shop");
        assert_eq!(ctx.retry_policy().max_retries, 2);
    }

    #[tokio::test]
    async fn test_start_transaction_requires_scope() {
        let (_dir, ctx) = context().await;
        let result = ctx.start_transaction(None, None).await;
        assert!(matches!(result, Err(TransactionError::NoSessionScope)));
        assert!(ctx.client().active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_publishes_and_clears_ambient_session() {
        let (_dir, ctx) = context().await;

        SessionContext::scope(async {
            let tx = ctx.start_transaction(None, None).await.unwrap();
            let ambient = SessionContext::current().unwrap();
            assert!(ambient.same_session(tx.session()));

            tx.commit().await.unwrap();
            assert!(SessionContext::current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_start_is_rejected() {
        let (_dir, ctx) = context().await;

        SessionContext::scope(async {
            let first = ctx.start_transaction(None, None).await.unwrap();
            let first_id = first.session_id().to_string();

            let nested = ctx.start_transaction(None, None).await;
            assert!(matches!(nested, Err(TransactionError::AlreadyInProgress)));
            assert_eq!(SessionContext::current().unwrap().id(), first_id);
            assert_eq!(ctx.client().active_sessions(), vec![first_id]);

            first.commit().await.unwrap();

            let next = ctx.start_transaction(None, None).await.unwrap();
            drop(next);
            assert!(SessionContext::current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_slot_is_not_cleared_by_a_stale_handle() {
        let (_dir, ctx) = context().await;

        SessionContext::scope(async {
            let tx = ctx.start_transaction(None, None).await.unwrap();
            let other = ctx.client().start_session(None);
            SessionContext::set(Some(other.clone())).unwrap();

            drop(tx);
            assert!(SessionContext::current().unwrap().same_session(&other));
        })
        .await;
    }
}
