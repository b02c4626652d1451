//! The git-backed document store.
//!
//! `GitStore` is the only type above this module that touches git. It wraps
//! `git2::Repository` behind a mutex and exposes document operations against
//! either `main` or a session branch.
//!
//! Every write follows the same shape: resolve the branch tip, build a new
//! tree on top of it, commit, then compare-and-swap the branch from the old
//! tip to the new commit. In-process writers are serialized by the mutex; the
//! CAS catches writers in other processes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::Repository;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::storage::blob::{self, StoreMeta};
use crate::storage::commit::{self, CommitBuilder, CommitInfo, CommitMessage};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::refs::RefManager;
use crate::storage::tree::{TreeHandle, TreeMutator};
use crate::storage::types::{
    BranchName, Change, ChangeStatus, CollectionName, CommitId, DatabaseName, DocumentId,
    DocumentPath, GitSignature,
};

/// Handle to one store on disk. Clones share the same repository.
#[derive(Clone)]
pub struct GitStore {
    inner: Arc<GitStoreInner>,
}

struct GitStoreInner {
    repo: Mutex<Repository>,
    path: PathBuf,
    database: DatabaseName,
    signature: GitSignature,
    /// Runs once, just before the next compare-and-swap of `main` in a
    /// session commit.
    #[cfg(test)]
    before_main_update: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// How a session commit reached `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommit {
    /// The session wrote nothing; `main` was left alone.
    Empty,
    /// `main` had not moved since the session began and now points at the session head.
    FastForward(CommitId),
    /// `main` had moved; the session's changes were replayed in a merge commit.
    Merged(CommitId),
}

impl SessionCommit {
    pub fn commit_id(&self) -> Option<CommitId> {
        match self {
            SessionCommit::Empty => None,
            SessionCommit::FastForward(id) | SessionCommit::Merged(id) => Some(*id),
        }
    }
}

impl std::fmt::Debug for GitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitStore")
            .field("path", &self.inner.path)
            .field("database", &self.inner.database)
            .finish()
    }
}

impl GitStore {
    /// Open an existing store and check that it holds `database`.
    pub fn open(
        path: impl AsRef<Path>,
        database: &DatabaseName,
        signature: GitSignature,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        let repo =
            Repository::open(path).map_err(|_| StorageError::NotInitialized(path.to_path_buf()))?;

        let store = Self::from_repo(repo, path, database, signature);
        store.verify_meta()?;
        debug!(path = %path.display(), database = %database, "opened store");
        Ok(store)
    }

    /// Create a new store with an initial commit holding only its metadata.
    pub fn init(
        path: impl AsRef<Path>,
        database: &DatabaseName,
        signature: GitSignature,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;
        let repo = Repository::init(path)?;

        let store = Self::from_repo(repo, path, database, signature);
        store.with_repo(|repo| {
            let meta_blob = StoreMeta::new(database).write(repo)?;
            let commit_id = commit::create_initial_commit(repo, &store.inner.signature, meta_blob)?;
            RefManager::init_main_branch(repo, commit_id)
        })?;

        info!(path = %path.display(), database = %database, "initialized store");
        Ok(store)
    }

    /// Open the store at `path`, creating it when `create` is set.
    pub fn open_or_init(
        path: impl AsRef<Path>,
        database: &DatabaseName,
        signature: GitSignature,
        create: bool,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        if Repository::open(path).is_ok() {
            Self::open(path, database, signature)
        } else if create {
            Self::init(path, database, signature)
        } else {
            Err(StorageError::NotInitialized(path.to_path_buf()))
        }
    }

    fn from_repo(
        repo: Repository,
        path: &Path,
        database: &DatabaseName,
        signature: GitSignature,
    ) -> Self {
        Self {
            inner: Arc::new(GitStoreInner {
                repo: Mutex::new(repo),
                path: path.to_path_buf(),
                database: database.clone(),
                signature,
                #[cfg(test)]
                before_main_update: Mutex::new(None),
            }),
        }
    }

    fn verify_meta(&self) -> StorageResult<()> {
        self.with_repo(|repo| {
            let head = RefManager::main_commit(repo)?;
            let tree = commit::get_tree_at_commit(repo, head)?;
            let meta_blob = tree.meta_blob_id().ok_or_else(|| StorageError::CorruptedData {
                path: PathBuf::from("_meta/store.json"),
                reason: "store metadata is missing".to_string(),
            })?;
            let meta = StoreMeta::read(repo, meta_blob)?;
            if meta.database != self.inner.database.as_str() {
                return Err(StorageError::DatabaseMismatch {
                    expected: self.inner.database.to_string(),
                    found: meta.database,
                });
            }
            Ok(())
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn database(&self) -> &DatabaseName {
        &self.inner.database
    }

    pub fn signature(&self) -> &GitSignature {
        &self.inner.signature
    }

    /// Run `f` with exclusive access to the repository.
    pub fn with_repo<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Repository) -> StorageResult<T>,
    {
        let repo = self.inner.repo.lock();
        f(&repo)
    }

    /// Tip of `main`.
    pub fn head(&self) -> StorageResult<CommitId> {
        self.with_repo(RefManager::main_commit)
    }

    /// Tip of a session branch.
    pub fn session_head(&self, session_id: &str) -> StorageResult<CommitId> {
        self.with_repo(|repo| RefManager::resolve_branch(repo, &BranchName::for_session(session_id)))
    }

    fn branch_for(session_id: Option<&str>) -> BranchName {
        match session_id {
            Some(id) => BranchName::for_session(id),
            None => BranchName::main(),
        }
    }

    // ==================== Reads ====================

    pub fn list_collections(&self, session_id: Option<&str>) -> StorageResult<Vec<CollectionName>> {
        let branch = Self::branch_for(session_id);
        self.with_repo(|repo| {
            let at = RefManager::resolve_branch(repo, &branch)?;
            Ok(commit::get_tree_at_commit(repo, at)?.list_collections())
        })
    }

    /// Read one document from `main` or from a session branch.
    pub fn read_document(
        &self,
        collection: &CollectionName,
        id: &DocumentId,
        session_id: Option<&str>,
    ) -> StorageResult<Option<Value>> {
        let branch = Self::branch_for(session_id);
        self.with_repo(|repo| {
            let at = RefManager::resolve_branch(repo, &branch)?;
            let tree = commit::get_tree_at_commit(repo, at)?;

            let Some(blob_id) = tree.document_blob_id(repo, collection, id)? else {
                return Ok(None);
            };

            let bytes = blob::read_blob(repo, blob_id)?;
            Ok(Some(blob::deserialize_document(&bytes, id)?))
        })
    }

    /// All documents of a collection ordered by id. A missing collection is empty.
    pub fn scan_collection(
        &self,
        collection: &CollectionName,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<Value>> {
        let branch = Self::branch_for(session_id);
        self.with_repo(|repo| {
            let at = RefManager::resolve_branch(repo, &branch)?;
            let tree = commit::get_tree_at_commit(repo, at)?;
            scan_tree(repo, &tree, collection)
        })
    }

    // ==================== Writes ====================

    /// Build a commit on the branch tip and move the branch to it.
    ///
    /// `f` stages changes and returns the commit message, or `None` when there
    /// is nothing to commit (the tip is returned unchanged).
    fn update_branch_with<F>(&self, branch: &BranchName, f: F) -> StorageResult<CommitId>
    where
        F: for<'r> FnOnce(&'r Repository, &TreeHandle<'r>, &mut TreeMutator<'r>) -> StorageResult<Option<String>>,
    {
        self.with_repo(|repo| {
            let tip = RefManager::resolve_branch(repo, branch)?;
            let tree = commit::get_tree_at_commit(repo, tip)?;
            let mut mutator = TreeMutator::from_tree(repo, &tree)?;

            let Some(message) = f(repo, &tree, &mut mutator)? else {
                return Ok(tip);
            };

            let tree_id = mutator.write()?;
            let new_commit = CommitBuilder::new(repo)
                .tree(tree_id)
                .parent(tip)
                .message(message)
                .signature(self.inner.signature.clone())
                .commit()?;

            RefManager::update_branch_if_unchanged(repo, branch, tip, new_commit)?;
            debug!(branch = %branch, commit = %new_commit.short(), "branch updated");
            Ok(new_commit)
        })
    }

    /// Insert documents into a collection in a single commit.
    ///
    /// Fails with `DocumentAlreadyExists` if any `_id` is already present in
    /// the collection or repeated within `documents`; nothing is written then.
    pub fn insert_documents(
        &self,
        collection: &CollectionName,
        documents: &[Value],
        session_id: Option<&str>,
    ) -> StorageResult<CommitId> {
        let branch = Self::branch_for(session_id);
        self.update_branch_with(&branch, |repo, tree, mutator| {
            let mut seen = HashSet::with_capacity(documents.len());
            let mut last_id = None;

            for document in documents {
                let id = blob::document_id(document)?;
                if !seen.insert(id.clone()) || tree.document_exists(repo, collection, &id)? {
                    return Err(StorageError::DocumentAlreadyExists {
                        collection: collection.clone(),
                        id,
                    });
                }
                let blob_id = blob::write_blob(repo, document)?;
                mutator.upsert_document(collection, &id, blob_id)?;
                last_id = Some(id);
            }

            Ok(match (documents.len(), last_id) {
                (_, None) => None,
                (1, Some(id)) => Some(CommitMessage::insert(collection.as_str(), id.as_str(), session_id)),
                (n, Some(_)) => Some(CommitMessage::insert_many(collection.as_str(), n, session_id)),
            })
        })
    }

    /// Delete one document. Returns whether it existed.
    pub fn delete_document(
        &self,
        collection: &CollectionName,
        id: &DocumentId,
        session_id: Option<&str>,
    ) -> StorageResult<bool> {
        let branch = Self::branch_for(session_id);
        let mut removed = false;
        self.update_branch_with(&branch, |_, _, mutator| {
            removed = mutator.remove_document(collection, id)?;
            Ok(removed.then(|| CommitMessage::delete(collection.as_str(), id.as_str(), session_id)))
        })?;
        Ok(removed)
    }

    // ==================== Sessions ====================

    /// Fork `session/{session_id}` from `main`. Returns the base commit.
    pub fn begin_session(&self, session_id: &str) -> StorageResult<CommitId> {
        self.with_repo(|repo| {
            let base = RefManager::main_commit(repo)?;
            RefManager::create_session_branch(repo, session_id, base)?;
            debug!(session_id, base = %base.short(), "session branch created");
            Ok(base)
        })
    }

    /// Land a session's writes on `main`.
    ///
    /// `base` is the commit the session branch was forked from. On success the
    /// session branch is deleted. A `MergeConflict` leaves the branch in place
    /// for the caller to abort; a lost CAS on `main` surfaces as the transient
    /// `ConcurrentModification`.
    pub fn commit_session(&self, session_id: &str, base: CommitId) -> StorageResult<SessionCommit> {
        self.with_repo(|repo| {
            let session_branch = BranchName::for_session(session_id);
            let main_branch = BranchName::main();
            let session_head = RefManager::resolve_branch(repo, &session_branch)?;
            let main_head = RefManager::main_commit(repo)?;

            let outcome = if session_head == base {
                SessionCommit::Empty
            } else if main_head == base {
                self.before_main_update();
                RefManager::update_branch_if_unchanged(repo, &main_branch, base, session_head)?;
                SessionCommit::FastForward(session_head)
            } else {
                let conflicts = commit::detect_conflicts(repo, base, session_head, main_head)?;
                if !conflicts.is_empty() {
                    debug!(session_id, conflicts = conflicts.len(), "session conflicts with main");
                    return Err(StorageError::MergeConflict {
                        conflicting_paths: conflicts,
                    });
                }

                let merged = self.replay_session(repo, session_id, base, session_head, main_head)?;
                self.before_main_update();
                RefManager::update_branch_if_unchanged(repo, &main_branch, main_head, merged)?;
                SessionCommit::Merged(merged)
            };

            RefManager::delete_session_branch(repo, session_id)?;
            info!(session_id, outcome = ?outcome, "session committed");
            Ok(outcome)
        })
    }

    #[cfg(test)]
    pub(crate) fn set_before_main_update<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.before_main_update.lock() = Some(Box::new(f));
    }

    #[cfg(test)]
    fn before_main_update(&self) {
        let hook = self.inner.before_main_update.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    #[cfg(not(test))]
    fn before_main_update(&self) {}

    /// Apply the session's changes since `base` onto `main`'s tree and write
    /// a merge commit with parents `[main, session]`.
    fn replay_session(
        &self,
        repo: &Repository,
        session_id: &str,
        base: CommitId,
        session_head: CommitId,
        main_head: CommitId,
    ) -> StorageResult<CommitId> {
        let changes = commit::diff_commits(repo, base, session_head)?;
        let session_tree = commit::get_tree_at_commit(repo, session_head)?;
        let main_tree = commit::get_tree_at_commit(repo, main_head)?;
        let mut mutator = TreeMutator::from_tree(repo, &main_tree)?;

        for change in &changes {
            let Some(path) = DocumentPath::parse(&change.path) else {
                continue;
            };
            apply_change(repo, &session_tree, &mut mutator, change, &path)?;
        }

        let tree_id = mutator.write()?;
        CommitBuilder::new(repo)
            .tree(tree_id)
            .parents(vec![main_head, session_head])
            .message(CommitMessage::session_commit(session_id))
            .signature(self.inner.signature.clone())
            .commit()
    }

    /// Discard a session branch. Returns whether it existed.
    pub fn end_session(&self, session_id: &str) -> StorageResult<bool> {
        self.with_repo(|repo| {
            let deleted = RefManager::delete_session_branch(repo, session_id)?;
            if deleted {
                debug!(session_id, "session branch deleted");
            }
            Ok(deleted)
        })
    }

    pub fn list_session_branches(&self) -> StorageResult<Vec<BranchName>> {
        self.with_repo(RefManager::list_session_branches)
    }

    /// Delete session branches left behind by crashed processes.
    ///
    /// Branches whose session id is in `keep` are left alone.
    pub fn cleanup_abandoned_sessions(&self, keep: &[String]) -> StorageResult<usize> {
        self.with_repo(|repo| {
            let mut deleted = 0;
            for branch in RefManager::list_session_branches(repo)? {
                let Some(session_id) = branch.session_id() else {
                    continue;
                };
                if keep.iter().any(|k| k == session_id) {
                    continue;
                }
                match RefManager::delete_session_branch(repo, session_id) {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(session_id, error = %e, "failed to delete abandoned session"),
                }
            }
            Ok(deleted)
        })
    }

    // ==================== History ====================

    /// Commits reachable from `main`, newest first.
    pub fn history(&self, limit: Option<usize>) -> StorageResult<Vec<CommitInfo>> {
        self.with_repo(|repo| {
            let head = RefManager::main_commit(repo)?;
            let iter = commit::history(repo, head)?.first_parent_only();
            match limit {
                Some(n) => iter.take(n).collect(),
                None => iter.collect(),
            }
        })
    }

    pub fn diff(&self, old: CommitId, new: CommitId) -> StorageResult<Vec<Change>> {
        self.with_repo(|repo| commit::diff_commits(repo, old, new))
    }

    pub fn stats(&self) -> StorageResult<StoreStats> {
        self.with_repo(|repo| {
            let head = RefManager::main_commit(repo)?;
            let tree = commit::get_tree_at_commit(repo, head)?;
            let collections = tree.list_collections();

            let mut document_count = 0;
            for collection in &collections {
                document_count += tree.list_documents(repo, collection)?.len();
            }

            let commit_count = commit::history(repo, head)?.first_parent_only().count();
            let session_branches = RefManager::list_session_branches(repo)?.len();

            Ok(StoreStats {
                database: self.inner.database.to_string(),
                head,
                collection_count: collections.len(),
                document_count,
                commit_count,
                session_branches,
            })
        })
    }
}

fn scan_tree<'r>(
    repo: &'r Repository,
    tree: &TreeHandle<'r>,
    collection: &CollectionName,
) -> StorageResult<Vec<Value>> {
    let ids = tree.list_documents(repo, collection)?;
    let mut documents = Vec::with_capacity(ids.len());

    for id in ids {
        let blob_id = tree
            .document_blob_id(repo, collection, &id)?
            .ok_or_else(|| StorageError::Internal(format!("listed document {} vanished", id)))?;
        let bytes = blob::read_blob(repo, blob_id)?;
        documents.push(blob::deserialize_document(&bytes, &id)?);
    }

    Ok(documents)
}

fn apply_change<'r>(
    repo: &'r Repository,
    source: &TreeHandle<'r>,
    mutator: &mut TreeMutator<'r>,
    change: &Change,
    path: &DocumentPath,
) -> StorageResult<()> {
    match change.status {
        ChangeStatus::Deleted => {
            mutator.remove_document(&path.collection, &path.id)?;
        }
        _ => match source.document_blob_id(repo, &path.collection, &path.id)? {
            Some(blob_id) => mutator.upsert_document(&path.collection, &path.id, blob_id)?,
            None => {
                mutator.remove_document(&path.collection, &path.id)?;
            }
        },
    }
    Ok(())
}

/// Summary of a store at the tip of `main`.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub database: String,
    pub head: CommitId,
    pub collection_count: usize,
    pub document_count: usize,
    pub commit_count: usize,
    pub session_branches: usize,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store Statistics ({}):", self.database)?;
        writeln!(f, "  Head: {}", self.head.short())?;
        writeln!(f, "  Collections: {}", self.collection_count)?;
        writeln!(f, "  Documents: {}", self.document_count)?;
        writeln!(f, "  Commits: {}", self.commit_count)?;
        write!(f, "  Open Sessions: {}", self.session_branches)
    }
}
