//! Connection strings.
//!
//! ```text
//! gitdoc://[localhost]/<root-path>/<database>[?create=true&author=...&email=...&maxCommitRetries=5]
//! ```
//!
//! The last path segment names the database; the store lives in the git
//! repository `<root-path>/<database>`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

use crate::storage::{DatabaseName, GitSignature};

const SCHEME: &str = "gitdoc://";

#[derive(Debug, Error)]
#[error("invalid connection string: {reason}")]
pub struct ConnectionStringError {
    reason: String,
}

impl ConnectionStringError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub root: PathBuf,
    pub database: DatabaseName,
    /// Create the store if it does not exist yet.
    pub create: bool,
    pub signature: GitSignature,
    pub max_commit_retries: Option<u32>,
}

impl ConnectionString {
    pub fn new(root: impl Into<PathBuf>, database: DatabaseName) -> Self {
        Self {
            root: root.into(),
            database,
            create: true,
            signature: GitSignature::gitdoc(),
            max_commit_retries: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, ConnectionStringError> {
        let rest = input
            .trim()
            .strip_prefix(SCHEME)
            .ok_or_else(|| ConnectionStringError::new(format!("must start with {}", SCHEME)))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let path = match location.split_once('/') {
            Some(("", path)) | Some(("localhost", path)) => path,
            Some((host, _)) => {
                return Err(ConnectionStringError::new(format!(
                    "unsupported host '{}', only local stores are supported",
                    host
                )));
            }
            None => return Err(ConnectionStringError::new("missing database path")),
        };

        let mut segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;

        let database = segments
            .pop()
            .ok_or_else(|| ConnectionStringError::new("missing database name"))?;
        let database = DatabaseName::new(database)
            .map_err(|e| ConnectionStringError::new(format!("database name: {}", e)))?;

        let mut root = PathBuf::from("/");
        root.extend(segments);

        let mut conn = Self::new(root, database);
        if let Some(query) = query {
            conn.apply_options(query)?;
        }
        Ok(conn)
    }

    fn apply_options(&mut self, query: &str) -> Result<(), ConnectionStringError> {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConnectionStringError::new(format!("option '{}' has no value", pair)))?;
            let value = decode(value)?;

            match key {
                "create" => {
                    self.create = value
                        .parse()
                        .map_err(|_| ConnectionStringError::new("create must be true or false"))?;
                }
                "author" => self.signature.name = value,
                "email" => self.signature.email = value,
                "maxCommitRetries" => {
                    let retries = value.parse().map_err(|_| {
                        ConnectionStringError::new("maxCommitRetries must be a non-negative integer")
                    })?;
                    self.max_commit_retries = Some(retries);
                }
                other => warn!(option = other, "ignoring unknown connection string option"),
            }
        }
        Ok(())
    }

    /// Directory of the store's git repository.
    pub fn store_path(&self) -> PathBuf {
        self.root.join(self.database.as_str())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn decode(segment: &str) -> Result<String, ConnectionStringError> {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .map_err(|_| ConnectionStringError::new(format!("'{}' is not valid UTF-8 once decoded", segment)))
}

impl FromStr for ConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SCHEME)?;
        for component in self.root.iter().filter(|c| *c != "/") {
            write!(f, "/{}", urlencoding::encode(&component.to_string_lossy()))?;
        }
        write!(f, "/{}", self.database)?;

        let mut options = Vec::new();
        if !self.create {
            options.push("create=false".to_string());
        }
        let default_signature = GitSignature::gitdoc();
        if self.signature.name != default_signature.name {
            options.push(format!("author={}", urlencoding::encode(&self.signature.name)));
        }
        if self.signature.email != default_signature.email {
            options.push(format!("email={}", urlencoding::encode(&self.signature.email)));
        }
        if let Some(retries) = self.max_commit_retries {
            options.push(format!("maxCommitRetries={}", retries));
        }
        if !options.is_empty() {
            write!(f, "?{}", options.join("&"))?;
        }
        Ok(())
    }
}
