//! Database configuration.

use std::path::PathBuf;

use crate::client::ConnectionString;
use crate::db::error::{DatabaseError, DatabaseResult};
use crate::storage::{DatabaseName, GitSignature};
use crate::transaction::RetryPolicy;

/// Database configuration options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    /// Directory holding the database stores.
    pub root: PathBuf,
    pub database: DatabaseName,
    /// Create the store if it doesn't exist.
    pub create_if_missing: bool,
    /// Author and committer of store commits.
    pub signature: GitSignature,
    /// Retry policy for transaction commits.
    pub retry: RetryPolicy,
}

impl DbConfig {
    pub fn new(root: impl Into<PathBuf>, database: &str) -> DatabaseResult<Self> {
        let database = DatabaseName::new(database)
            .map_err(|e| DatabaseError::InvalidConfig(format!("database name: {}", e)))?;
        Ok(Self {
            root: root.into(),
            database,
            create_if_missing: true,
            signature: GitSignature::gitdoc(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn from_connection_string(connection_string: &str) -> DatabaseResult<Self> {
        Ok(ConnectionString::parse(connection_string)?.into())
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn max_commit_retries(mut self, max_retries: u32) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join(self.database.as_str())
    }

    pub fn connection_string(&self) -> ConnectionString {
        ConnectionString {
            root: self.root.clone(),
            database: self.database.clone(),
            create: self.create_if_missing,
            signature: self.signature.clone(),
            max_commit_retries: Some(self.retry.max_retries),
        }
    }
}

impl From<ConnectionString> for DbConfig {
    fn from(conn: ConnectionString) -> Self {
        let retry = match conn.max_commit_retries {
            Some(max) => RetryPolicy::new(max),
            None => RetryPolicy::default(),
        };
        Self {
            root: conn.root,
            database: conn.database,
            create_if_missing: conn.create,
            signature: conn.signature,
            retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = DbConfig::new("/data", "shop")
            .unwrap()
            .create_if_missing(false)
            .max_commit_retries(2);

        assert_eq!(config.store_path(), PathBuf::from("/data/shop"));
        assert!(!config.create_if_missing);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay, RetryPolicy::DEFAULT_BASE_DELAY);

        assert!(matches!(
            DbConfig::new("/data", "9lives"),
            Err(DatabaseError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_from_connection_string() {
        let config =
            DbConfig::from_connection_string("gitdoc:///data/shop?maxCommitRetries=0&author=ops")
                .unwrap();
        assert_eq!(config.retry, RetryPolicy::no_retry());
        assert_eq!(config.signature.name, "ops");

        let default = DbConfig::from_connection_string("gitdoc:///data/shop").unwrap();
        assert_eq!(default.retry, RetryPolicy::default());

        assert!(matches!(
            DbConfig::from_connection_string("postgres://x/y"),
            Err(DatabaseError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn test_connection_string_roundtrip() {
        let config = DbConfig::new("/data", "shop").unwrap().max_commit_retries(3);
        let parsed = DbConfig::from_connection_string(&config.connection_string().to_string()).unwrap();
        assert_eq!(parsed, config);
    }
}
