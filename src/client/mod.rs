//! Async client driver over the git store.
//!
//! Mirrors the shape of a document database driver: a [`Client`] owns the
//! store, hands out [`ClientSession`]s and a [`Database`] handle, and typed
//! [`Collection`]s run session-bound or unbound operations.
//!
//! Git work is blocking, so every operation runs on tokio's blocking pool.
//!
//! ```ignore
//! let conn = ConnectionString::parse("gitdoc:///var/lib/gitdoc/shop")?;
//! let client = Client::connect(&conn).await?;
//! let products = client.database().collection::<Product>("products")?;
//!
//! let session = client.start_session(None);
//! session.start_transaction(None).await?;
//! products.insert_one(&widget, Some(&session)).await?;
//! session.commit_transaction().await?;
//! ```

mod collection;
mod connection;
mod session;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use ulid::Ulid;

use crate::storage::{CollectionName, DatabaseName, GitStore, StorageResult};

pub use collection::Collection;
pub use connection::{ConnectionString, ConnectionStringError};
pub use session::{ClientSession, SessionOptions, TransactionOptions, TransactionState};

/// Entry point of the driver. Clones share the same store and session registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    store: GitStore,
    /// Sessions that have not ended yet, with their start time.
    active: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("store", &self.inner.store)
            .field("active_sessions", &self.inner.active.read().len())
            .finish()
    }
}

impl Client {
    /// Open (or create, if the connection string allows it) the store.
    pub async fn connect(conn: &ConnectionString) -> StorageResult<Self> {
        let conn = conn.clone();
        let store = tokio::task::spawn_blocking(move || {
            GitStore::open_or_init(
                conn.store_path(),
                &conn.database,
                conn.signature.clone(),
                conn.create,
            )
        })
        .await??;

        info!(path = %store.path().display(), database = %store.database(), "client connected");
        Ok(Self::from_store(store))
    }

    pub fn from_store(store: GitStore) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                store,
                active: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &GitStore {
        &self.inner.store
    }

    pub fn database(&self) -> Database {
        Database {
            client: self.clone(),
        }
    }

    /// Start a new session. No store work happens until a transaction begins.
    pub fn start_session(&self, options: Option<SessionOptions>) -> ClientSession {
        let id = Ulid::new().to_string().to_lowercase();
        self.inner.active.write().insert(id.clone(), Utc::now());
        debug!(session_id = %id, "session started");
        ClientSession::new(id, self.clone(), options.unwrap_or_default())
    }

    /// Ids of sessions that have not ended.
    pub fn active_sessions(&self) -> Vec<String> {
        self.inner.active.read().keys().cloned().collect()
    }

    pub(crate) fn unregister_session(&self, session_id: &str) {
        self.inner.active.write().remove(session_id);
    }

    /// Delete session branches that belong to no live session of this client,
    /// e.g. left behind by a crashed process.
    pub async fn cleanup_abandoned_sessions(&self) -> StorageResult<usize> {
        let keep = self.active_sessions();
        let cleaned = self
            .blocking(move |store| store.cleanup_abandoned_sessions(&keep))
            .await?;
        if cleaned > 0 {
            info!(cleaned, "removed abandoned session branches");
        }
        Ok(cleaned)
    }

    /// Run a store operation on the blocking pool.
    pub(crate) async fn blocking<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&GitStore) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || f(&store)).await?
    }
}

/// Handle to the client's database.
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
}

impl Database {
    pub fn name(&self) -> &DatabaseName {
        self.client.store().database()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A typed handle to a collection. The collection itself appears with its
    /// first document.
    pub fn collection<T>(&self, name: &str) -> StorageResult<Collection<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let name = CollectionName::new(name)?;
        Ok(Collection::new(self.client.clone(), name))
    }

    pub async fn list_collection_names(
        &self,
        session: Option<&ClientSession>,
    ) -> StorageResult<Vec<CollectionName>> {
        match session {
            Some(session) => {
                session
                    .run(|store, target| store.list_collections(target))
                    .await
            }
            None => {
                self.client
                    .blocking(|store| store.list_collections(None))
                    .await
            }
        }
    }
}
