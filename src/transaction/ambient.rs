//! The ambient session of a logical call chain.
//!
//! A transaction started on one call path has to be visible to repository
//! calls made later on the same path, across `.await` points, without being
//! passed around. The slot is a tokio task-local, so it is never shared with
//! concurrently running or spawned tasks.
//!
//! Task-locals only exist inside an explicit scope:
//!
//! ```ignore
//! SessionContext::scope(async {
//!     let tx = repository.start_transaction().await?;
//!     repository.insert(&product).await?;   // joins the ambient session
//!     tx.commit().await?;
//!     Ok(())
//! })
//! .await
//! ```

use std::cell::RefCell;
use std::future::Future;

use crate::client::ClientSession;
use crate::transaction::error::{TransactionError, TransactionResult};

tokio::task_local! {
    static AMBIENT_SESSION: RefCell<Option<ClientSession>>;
}

/// Accessors for the per-chain session slot.
pub struct SessionContext;

impl SessionContext {
    /// Run `f` with a session slot. Re-entrant: inside an existing scope the
    /// existing slot is used.
    pub async fn scope<F>(f: F) -> F::Output
    where
        F: Future,
    {
        if Self::in_scope() {
            f.await
        } else {
            AMBIENT_SESSION.scope(RefCell::new(None), f).await
        }
    }

    pub fn in_scope() -> bool {
        AMBIENT_SESSION.try_with(|_| ()).is_ok()
    }

    /// The session published on this chain, if any. `None` outside a scope.
    ///
    /// A session that has ended counts as an empty slot and is dropped from
    /// it. This happens when its transaction completed on another task, where
    /// this chain's slot could not be cleared.
    pub fn current() -> Option<ClientSession> {
        AMBIENT_SESSION
            .try_with(|slot| live_session(&mut slot.borrow_mut()))
            .ok()
            .flatten()
    }

    /// Replace the slot's content.
    pub fn set(session: Option<ClientSession>) -> TransactionResult<()> {
        AMBIENT_SESSION
            .try_with(|slot| *slot.borrow_mut() = session)
            .map_err(|_| TransactionError::NoSessionScope)
    }

    /// Fill an empty slot. Never overwrites a session that is still live.
    pub(crate) fn publish(session: &ClientSession) -> TransactionResult<()> {
        AMBIENT_SESSION
            .try_with(|slot| {
                let mut slot = slot.borrow_mut();
                if live_session(&mut slot).is_some() {
                    return Err(TransactionError::AlreadyInProgress);
                }
                *slot = Some(session.clone());
                Ok(())
            })
            .map_err(|_| TransactionError::NoSessionScope)?
    }

    /// Empty the slot if it still holds `session_id`. Returns whether it did.
    pub(crate) fn clear_if(session_id: &str) -> bool {
        AMBIENT_SESSION
            .try_with(|slot| {
                let mut slot = slot.borrow_mut();
                if slot.as_ref().is_some_and(|s| s.id() == session_id) {
                    *slot = None;
                    true
                } else {
                    false
                }
            })
            .unwrap_or(false)
    }
}

fn live_session(slot: &mut Option<ClientSession>) -> Option<ClientSession> {
    if slot.as_ref().is_some_and(|s| s.is_ended()) {
        *slot = None;
    }
    slot.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::storage::{DatabaseName, GitSignature, GitStore};
    use tempfile::TempDir;

    fn client() -> (TempDir, Client) {
        let dir = TempDir::new().unwrap();
        let db = DatabaseName::new("shop").unwrap();
        let store = GitStore::init(dir.path(), &db, GitSignature::gitdoc()).unwrap();
        (dir, Client::from_store(store))
    }

    #[tokio::test]
    async fn test_outside_scope() {
        assert!(!SessionContext::in_scope());
        assert!(SessionContext::current().is_none());
        assert!(matches!(
            SessionContext::set(None),
            Err(TransactionError::NoSessionScope)
        ));
    }

    #[tokio::test]
    async fn test_visible_across_await_points() {
        let (_dir, client) = client();
        let session = client.start_session(None);
        let id = session.id().to_string();

        SessionContext::scope(async move {
            SessionContext::set(Some(session)).unwrap();
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            assert_eq!(SessionContext::current().unwrap().id(), id);
        })
        .await;
    }

    #[tokio::test]
    async fn test_publish_never_overwrites() {
        let (_dir, client) = client();
        let first = client.start_session(None);
        let second = client.start_session(None);

        SessionContext::scope(async {
            SessionContext::publish(&first).unwrap();
            assert!(matches!(
                SessionContext::publish(&second),
                Err(TransactionError::AlreadyInProgress)
            ));
            assert_eq!(SessionContext::current().unwrap().id(), first.id());

            assert!(!SessionContext::clear_if(second.id()));
            assert!(SessionContext::clear_if(first.id()));
            assert!(SessionContext::current().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn test_ended_session_counts_as_empty() {
        let (_dir, client) = client();
        let stale = client.start_session(None);
        let next = client.start_session(None);

        SessionContext::scope(async {
            SessionContext::publish(&stale).unwrap();
            stale.end_session();

            assert!(SessionContext::current().is_none());
            SessionContext::publish(&next).unwrap();
            assert!(SessionContext::current().unwrap().same_session(&next));
        })
        .await;
    }

    #[tokio::test]
    async fn test_nested_scope_reuses_slot() {
        let (_dir, client) = client();
        let session = client.start_session(None);
        let id = session.id().to_string();

        SessionContext::scope(async {
            SessionContext::set(Some(session)).unwrap();
            SessionContext::scope(async {
                assert_eq!(SessionContext::current().unwrap().id(), id);
            })
            .await;
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_task_does_not_inherit() {
        let (_dir, client) = client();
        let session = client.start_session(None);

        SessionContext::scope(async {
            SessionContext::set(Some(session)).unwrap();
            let seen = tokio::spawn(async { SessionContext::current().is_some() })
                .await
                .unwrap();
            assert!(!seen);
            assert!(SessionContext::current().is_some());
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_chains_are_isolated() {
        let (_dir, client) = client();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = client.start_session(None);
            handles.push(tokio::spawn(SessionContext::scope(async move {
                let id = session.id().to_string();
                SessionContext::set(Some(session)).unwrap();
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    assert_eq!(SessionContext::current().unwrap().id(), id);
                }
            })));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
