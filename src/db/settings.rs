//! Settings file with environment overrides.
//!
//! ```json
//! {
//!   "GitDoc": {
//!     "ConnectionString": "gitdoc:///var/lib/gitdoc/shop",
//!     "TestConnectionString": "gitdoc:///tmp/gitdoc/shop_test"
//!   }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::error::{DatabaseError, DatabaseResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "GitDoc", default)]
    pub gitdoc: GitDocSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GitDocSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_connection_string: Option<String>,
}

impl Settings {
    pub const CONNECTION_STRING_ENV: &'static str = "GITDOC_CONNECTION_STRING";
    pub const TEST_CONNECTION_STRING_ENV: &'static str = "GITDOC_TEST_CONNECTION_STRING";

    /// Read a settings file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?.with_overrides(|name| std::env::var(name).ok()))
    }

    /// Settings from the environment alone.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    pub fn from_json(text: &str) -> DatabaseResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Replace values for which `lookup` returns a non-empty string.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(value) = lookup(Self::CONNECTION_STRING_ENV) {
            self.gitdoc.connection_string = Some(value);
        }
        if let Some(value) = lookup(Self::TEST_CONNECTION_STRING_ENV) {
            self.gitdoc.test_connection_string = Some(value);
        }
        self
    }

    pub fn connection_string(&self) -> DatabaseResult<&str> {
        self.gitdoc
            .connection_string
            .as_deref()
            .ok_or_else(|| DatabaseError::InvalidConfig("GitDoc.ConnectionString is not set".to_string()))
    }

    pub fn test_connection_string(&self) -> DatabaseResult<&str> {
        self.gitdoc
            .test_connection_string
            .as_deref()
            .ok_or_else(|| {
                DatabaseError::InvalidConfig("GitDoc.TestConnectionString is not set".to_string())
            })
    }
}
