//! The transaction handle.

use std::fmt;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientSession, TransactionState};
use crate::storage::SessionCommit;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::retry::RetryPolicy;

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    Aborted,
    /// Dropped without commit or abort; treated as an abort.
    Disposed,
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed)
    }
}

impl fmt::Display for TransactionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionOutcome::Committed => write!(f, "committed"),
            TransactionOutcome::Aborted => write!(f, "aborted"),
            TransactionOutcome::Disposed => write!(f, "disposed"),
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(TransactionOutcome) + Send + 'static>;

/// One in-flight transaction.
///
/// Finished by the first of [`commit`](Self::commit), [`abort`](Self::abort)
/// or drop. Whichever path runs, the session is ended and the completion
/// callback fires exactly once. Both `commit` and `abort` consume the handle.
///
/// Dropping an unfinished transaction, or a failed commit, ends the session
/// synchronously: the session branch is deleted on the current thread while
/// holding the store lock. After a cancelled or timed-out commit this also
/// waits for the attempt still running on the blocking pool.
///
/// The handle may be finished on another task than the one that started it.
/// The starting chain then sees its ambient slot as empty once the session
/// has ended.
pub struct Transaction {
    session: ClientSession,
    retry: RetryPolicy,
    on_completed: Option<CompletionCallback>,
    outcome: Option<TransactionOutcome>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("session_id", &self.session.id())
            .field("retry", &self.retry)
            .field("outcome", &self.outcome)
            .finish()
    }
}

impl Transaction {
    /// Wrap a session whose transaction has already been started.
    pub(crate) fn new<F>(session: ClientSession, retry: RetryPolicy, on_completed: F) -> Self
    where
        F: FnOnce(TransactionOutcome) + Send + 'static,
    {
        Self {
            session,
            retry,
            on_completed: Some(Box::new(on_completed)),
            outcome: None,
        }
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn outcome(&self) -> Option<TransactionOutcome> {
        self.outcome
    }

    pub async fn commit(self) -> TransactionResult<SessionCommit> {
        self.commit_with(&CancellationToken::new()).await
    }

    /// Commit, retrying transient failures.
    ///
    /// On failure the session is released and the original error returned.
    /// A commit attempt already running when `cancel` fires or the
    /// `max_commit_time` elapses is not interrupted; if it lands, the
    /// outcome is still reported as committed.
    pub async fn commit_with(mut self, cancel: &CancellationToken) -> TransactionResult<SessionCommit> {
        let session = self.session.clone();
        let result = Self::run_commit(session, self.retry, cancel).await;

        match result {
            Ok(outcome) => {
                info!(session_id = %self.session.id(), ?outcome, "transaction committed");
                self.complete(TransactionOutcome::Committed);
                Ok(outcome)
            }
            Err(e) => {
                self.session.end_session();
                let outcome = if self.session.transaction_state() == TransactionState::Committed {
                    TransactionOutcome::Committed
                } else {
                    TransactionOutcome::Aborted
                };
                warn!(session_id = %self.session.id(), error = %e, %outcome, "transaction commit failed");
                self.complete(outcome);
                Err(e)
            }
        }
    }

    async fn run_commit(
        session: ClientSession,
        retry: RetryPolicy,
        cancel: &CancellationToken,
    ) -> TransactionResult<SessionCommit> {
        let session_id = session.id().to_string();
        let max_commit_time = session.transaction_options().max_commit_time;

        let attempts = retry.run(|| {
            let session = session.clone();
            async move {
                session
                    .commit_transaction()
                    .await
                    .map_err(TransactionError::from)
            }
        });

        let bounded = async {
            match max_commit_time {
                Some(max) => match tokio::time::timeout(max, attempts).await {
                    Ok(result) => result,
                    Err(_) => Err(TransactionError::Timeout {
                        session_id: session_id.clone(),
                        elapsed_ms: max.as_millis() as u64,
                    }),
                },
                None => attempts.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransactionError::Cancelled { session_id: session_id.clone() }),
            result = bounded => result,
        }
    }

    pub async fn abort(self) -> TransactionResult<()> {
        self.abort_with(&CancellationToken::new()).await
    }

    /// Abort once, without retries. The transaction completes as aborted even
    /// when the abort itself fails.
    pub async fn abort_with(mut self, cancel: &CancellationToken) -> TransactionResult<()> {
        let session = self.session.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransactionError::Cancelled {
                session_id: session.id().to_string(),
            }),
            result = session.abort_transaction() => result.map_err(TransactionError::from),
        };

        self.session.end_session();
        if let Err(e) = &result {
            warn!(session_id = %self.session.id(), error = %e, "transaction abort failed");
        }
        self.complete(TransactionOutcome::Aborted);
        result
    }

    fn complete(&mut self, outcome: TransactionOutcome) {
        if self.outcome.is_some() {
            return;
        }
        self.outcome = Some(outcome);
        self.session.end_session();
        if let Some(callback) = self.on_completed.take() {
            callback(outcome);
        }
        debug!(session_id = %self.session.id(), %outcome, "transaction completed");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            self.complete(TransactionOutcome::Disposed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::client::{Client, Collection, TransactionOptions};
    use crate::storage::{CollectionName, DatabaseName, GitSignature, GitStore};
    use serde_json::{Value, json};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        client: Client,
        products: Collection<Value>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = DatabaseName::new("shop").unwrap();
        let store = GitStore::init(dir.path(), &db, GitSignature::gitdoc()).unwrap();
        let client = Client::from_store(store);
        let products = client.database().collection("products").unwrap();
        Fixture {
            _dir: dir,
            client,
            products,
        }
    }

    type Recorded = Arc<Mutex<Vec<TransactionOutcome>>>;

    async fn begin(client: &Client, options: Option<TransactionOptions>) -> (Transaction, Recorded) {
        let session = client.start_session(None);
        session.start_transaction(options).await.unwrap();
        let recorded: Recorded = Arc::default();
        let sink = recorded.clone();
        let tx = Transaction::new(session, RetryPolicy::default(), move |outcome| {
            sink.lock().push(outcome)
        });
        (tx, recorded)
    }

    #[tokio::test]
    async fn test_commit_fires_callback_once() {
        let f = fixture();
        let (tx, recorded) = begin(&f.client, None).await;
        let session = tx.session().clone();

        f.products.insert_one(&json!({"_id": "p1"}), Some(&session)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Committed]);
        assert!(session.is_ended());
        assert_eq!(f.products.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_retries_after_main_moved_underneath() {
        let f = fixture();
        let session = f.client.start_session(None);
        session.start_transaction(None).await.unwrap();
        f.products.insert_one(&json!({"_id": "p1"}), Some(&session)).await.unwrap();

        // A second handle on the same repository stands in for another process
        // that moves `main` between reading it and swapping it.
        let store = f.client.store();
        let other = GitStore::open(store.path(), store.database(), GitSignature::gitdoc()).unwrap();
        let products = CollectionName::new("products").unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        store.set_before_main_update(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            other
                .insert_documents(&products, &[json!({"_id": "p2"})], None)
                .unwrap();
        });

        let recorded: Recorded = Arc::default();
        let sink = recorded.clone();
        let tx = Transaction::new(
            session.clone(),
            RetryPolicy::default().with_base_delay(Duration::from_millis(1)),
            move |outcome| sink.lock().push(outcome),
        );
        let result = tx.commit().await.unwrap();

        // The first attempt lost the swap; the retry saw the new `main` and merged.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(result, SessionCommit::Merged(_)));
        assert_eq!(session.transaction_state(), TransactionState::Committed);
        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Committed]);
        assert_eq!(f.products.count(None).await.unwrap(), 2);

        let history = f.client.store().history(Some(1)).unwrap();
        assert!(history[0].is_merge());
        assert!(f.client.store().list_session_branches().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_swap_keeps_transaction_in_progress() {
        let f = fixture();
        let session = f.client.start_session(None);
        session.start_transaction(None).await.unwrap();
        f.products.insert_one(&json!({"_id": "p1"}), Some(&session)).await.unwrap();

        let store = f.client.store();
        let other = GitStore::open(store.path(), store.database(), GitSignature::gitdoc()).unwrap();
        let products = CollectionName::new("products").unwrap();
        store.set_before_main_update(move || {
            other
                .insert_documents(&products, &[json!({"_id": "p2"})], None)
                .unwrap();
        });

        let err = session.commit_transaction().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(session.transaction_state(), TransactionState::InProgress);
        assert_eq!(f.client.store().list_session_branches().unwrap().len(), 1);

        let result = session.commit_transaction().await.unwrap();
        assert!(matches!(result, SessionCommit::Merged(_)));
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let f = fixture();
        let (tx, recorded) = begin(&f.client, None).await;
        let session = tx.session().clone();

        f.products.insert_one(&json!({"_id": "p1"}), Some(&session)).await.unwrap();
        tx.abort().await.unwrap();

        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Aborted]);
        assert_eq!(f.products.count(None).await.unwrap(), 0);
        assert!(f.client.store().list_session_branches().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_disposes() {
        let f = fixture();
        let (tx, recorded) = begin(&f.client, None).await;
        f.products
            .insert_one(&json!({"_id": "p1"}), Some(tx.session()))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Disposed]);
        assert_eq!(f.products.count(None).await.unwrap(), 0);
        assert!(f.client.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_completes_as_aborted() {
        let f = fixture();
        let (tx, recorded) = begin(&f.client, None).await;

        f.products
            .insert_one(&json!({"_id": "p1", "by": "tx"}), Some(tx.session()))
            .await
            .unwrap();
        f.products
            .insert_one(&json!({"_id": "p1", "by": "other"}), None)
            .await
            .unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Storage(crate::storage::StorageError::MergeConflict { .. })
        ));
        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Aborted]);
        assert!(f.client.store().list_session_branches().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_commit() {
        let f = fixture();
        let (tx, recorded) = begin(&f.client, None).await;
        f.products
            .insert_one(&json!({"_id": "p1"}), Some(tx.session()))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = tx.commit_with(&cancel).await.unwrap_err();

        assert!(matches!(err, TransactionError::Cancelled { .. }));
        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Aborted]);
        assert_eq!(f.products.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_commit_within_max_commit_time() {
        let f = fixture();
        let options = TransactionOptions::default().with_max_commit_time(Duration::from_secs(30));
        let (tx, recorded) = begin(&f.client, Some(options)).await;
        f.products
            .insert_one(&json!({"_id": "p1"}), Some(tx.session()))
            .await
            .unwrap();

        tx.commit().await.unwrap();
        assert_eq!(*recorded.lock(), vec![TransactionOutcome::Committed]);
    }

    #[tokio::test]
    async fn test_callback_count_across_paths() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));

        for path in 0..3 {
            let session = f.client.start_session(None);
            session.start_transaction(None).await.unwrap();
            let counter = calls.clone();
            let tx = Transaction::new(session, RetryPolicy::default(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            match path {
                0 => {
                    tx.commit().await.unwrap();
                }
                1 => tx.abort().await.unwrap(),
                _ => drop(tx),
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
