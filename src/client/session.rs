//! Client sessions.
//!
//! A session is the unit that owns a transaction. While a transaction is in
//! progress, operations bound to the session read and write the session's
//! branch; otherwise they go straight to `main`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::Client;
use crate::storage::{CommitId, GitStore, SessionCommit, StorageError, StorageResult};

/// Options applied to one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Upper bound on the whole commit, retries included.
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    pub fn with_max_commit_time(mut self, max: Duration) -> Self {
        self.max_commit_time = Some(max);
        self
    }
}

/// Options applied to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Used by transactions started without explicit options.
    pub default_transaction_options: Option<TransactionOptions>,
}

impl SessionOptions {
    pub fn with_default_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.default_transaction_options = Some(options);
        self
    }
}

/// Transaction state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    InProgress,
    Committed,
    Aborted,
}

struct SessionState {
    transaction: TransactionState,
    /// Commit `main` pointed at when the current transaction began.
    base: Option<CommitId>,
    transaction_options: TransactionOptions,
    ended: bool,
}

/// Handle to a driver session. Clones refer to the same session.
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: String,
    client: Client,
    options: SessionOptions,
    state: Mutex<SessionState>,
    /// Mirrors `state.ended`, readable without waiting on a running operation.
    ended: AtomicBool,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.inner.id)
            .field("transaction", &self.transaction_state())
            .finish()
    }
}

impl ClientSession {
    pub(crate) fn new(id: String, client: Client, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                client,
                options,
                state: Mutex::new(SessionState {
                    transaction: TransactionState::None,
                    base: None,
                    transaction_options: TransactionOptions::default(),
                    ended: false,
                }),
                ended: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.state.lock().transaction
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_state() == TransactionState::InProgress
    }

    /// Options of the current (or last) transaction.
    pub fn transaction_options(&self) -> TransactionOptions {
        self.inner.state.lock().transaction_options.clone()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same session.
    pub fn same_session(&self, other: &ClientSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Begin a transaction by forking a session branch from `main`.
    pub async fn start_transaction(&self, options: Option<TransactionOptions>) -> StorageResult<()> {
        let session = self.inner.clone();
        let options = options
            .or_else(|| self.inner.options.default_transaction_options.clone())
            .unwrap_or_default();

        self.inner
            .client
            .blocking(move |store| {
                let mut state = session.state.lock();
                session.check_open(&state)?;
                if state.transaction == TransactionState::InProgress {
                    return Err(StorageError::TransactionInProgress {
                        session_id: session.id.clone(),
                    });
                }

                let base = store.begin_session(&session.id)?;
                state.transaction = TransactionState::InProgress;
                state.base = Some(base);
                state.transaction_options = options;
                debug!(session_id = %session.id, base = %base.short(), "transaction started");
                Ok(())
            })
            .await
    }

    /// Commit the current transaction.
    ///
    /// A transient failure leaves the transaction in progress so the commit
    /// can be attempted again. Any other failure aborts the transaction.
    pub async fn commit_transaction(&self) -> StorageResult<SessionCommit> {
        let session = self.inner.clone();
        self.inner
            .client
            .blocking(move |store| {
                let mut state = session.state.lock();
                session.check_open(&state)?;
                let base = session.active_base(&state)?;

                match store.commit_session(&session.id, base) {
                    Ok(outcome) => {
                        state.transaction = TransactionState::Committed;
                        state.base = None;
                        Ok(outcome)
                    }
                    Err(e) if e.is_transient() => Err(e),
                    Err(e) => {
                        session.discard_branch(store);
                        state.transaction = TransactionState::Aborted;
                        state.base = None;
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Abort the current transaction, discarding its writes.
    pub async fn abort_transaction(&self) -> StorageResult<()> {
        let session = self.inner.clone();
        self.inner
            .client
            .blocking(move |store| {
                let mut state = session.state.lock();
                session.check_open(&state)?;
                session.active_base(&state)?;

                store.end_session(&session.id)?;
                state.transaction = TransactionState::Aborted;
                state.base = None;
                debug!(session_id = %session.id, "transaction aborted");
                Ok(())
            })
            .await
    }

    /// End the session. An in-progress transaction is aborted.
    ///
    /// Synchronous so it can run from `Drop`; failures are logged. Discarding
    /// the session branch is blocking git I/O on the calling thread, and waits
    /// for any operation of this session still running on the blocking pool.
    pub fn end_session(&self) {
        self.inner.end();
    }

    /// Run a store operation bound to this session.
    ///
    /// `f` receives the session id while a transaction is in progress and
    /// `None` otherwise. The session state stays locked for the duration.
    pub(crate) async fn run<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&GitStore, Option<&str>) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let session = self.inner.clone();
        self.inner
            .client
            .blocking(move |store| {
                let state = session.state.lock();
                session.check_open(&state)?;
                let target = (state.transaction == TransactionState::InProgress)
                    .then_some(session.id.as_str());
                f(store, target)
            })
            .await
    }
}

impl SessionInner {
    fn check_open(&self, state: &SessionState) -> StorageResult<()> {
        if state.ended {
            return Err(StorageError::SessionEnded {
                session_id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn active_base(&self, state: &SessionState) -> StorageResult<CommitId> {
        match (state.transaction, state.base) {
            (TransactionState::InProgress, Some(base)) => Ok(base),
            _ => Err(StorageError::NoTransactionInProgress {
                session_id: self.id.clone(),
            }),
        }
    }

    fn discard_branch(&self, store: &GitStore) {
        if let Err(e) = store.end_session(&self.id) {
            warn!(session_id = %self.id, error = %e, "failed to discard session branch");
        }
    }

    fn end(&self) {
        let mut state = self.state.lock();
        if state.ended {
            return;
        }
        state.ended = true;
        self.ended.store(true, Ordering::Release);

        if state.transaction == TransactionState::InProgress {
            self.discard_branch(self.client.store());
            state.transaction = TransactionState::Aborted;
            state.base = None;
            debug!(session_id = %self.id, "transaction aborted by end of session");
        }

        self.client.unregister_session(&self.id);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.end();
    }
}
