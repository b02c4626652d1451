//! Commit creation, history traversal and change detection.
//!
//! Every write is a commit. Session transactions accumulate commits on their
//! own branch; committing one replays its changes onto `main`, which needs the
//! diff and merge-base helpers below.

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use git2::{Delta, Diff, DiffOptions, Repository, Revwalk, Sort};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::tree::TreeHandle;
use crate::storage::types::{BlobId, Change, ChangeStatus, CommitId, GitSignature, TreeId};

/// Information about a commit.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub id: CommitId,
    pub tree_id: TreeId,
    pub parent_ids: Vec<CommitId>,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub timestamp: DateTime<Utc>,
}

impl CommitInfo {
    pub(crate) fn from_git2(commit: &git2::Commit<'_>) -> Self {
        let author = commit.author();
        let timestamp = Utc
            .timestamp_opt(commit.time().seconds(), 0)
            .single()
            .unwrap_or_else(Utc::now);

        Self {
            id: CommitId::new(commit.id()),
            tree_id: TreeId::new(commit.tree_id()),
            parent_ids: commit.parent_ids().map(CommitId::new).collect(),
            message: commit.message().unwrap_or("").to_string(),
            author_name: author.name().unwrap_or("unknown").to_string(),
            author_email: author.email().unwrap_or("unknown@unknown").to_string(),
            timestamp,
        }
    }

    /// True for the merge commits written when a session is replayed onto `main`.
    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() > 1
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or(&self.message)
    }
}

/// Fluent builder for commits.
pub struct CommitBuilder<'a> {
    repo: &'a Repository,
    tree_id: Option<TreeId>,
    parents: Vec<CommitId>,
    message: String,
    signature: GitSignature,
}

impl<'a> CommitBuilder<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self {
            repo,
            tree_id: None,
            parents: Vec::new(),
            message: String::new(),
            signature: GitSignature::gitdoc(),
        }
    }

    pub fn tree(mut self, tree_id: TreeId) -> Self {
        self.tree_id = Some(tree_id);
        self
    }

    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn parents(mut self, parents: Vec<CommitId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn signature(mut self, signature: GitSignature) -> Self {
        self.signature = signature;
        self
    }

    pub fn commit(self) -> StorageResult<CommitId> {
        let tree_id = self
            .tree_id
            .ok_or_else(|| StorageError::Internal("commit requires a tree".to_string()))?;

        let tree = self.repo.find_tree(tree_id.raw())?;
        let sig = self.signature.to_git2_signature()?;

        let parent_commits: Vec<git2::Commit<'_>> = self
            .parents
            .iter()
            .map(|id| self.repo.find_commit(id.raw()))
            .collect::<Result<_, _>>()?;
        let parent_refs: Vec<&git2::Commit<'_>> = parent_commits.iter().collect();

        // Refs are moved separately, by compare-and-swap.
        let oid = self.repo.commit(
            None,
            &sig,
            &sig,
            &self.message,
            &tree,
            &parent_refs,
        )?;

        Ok(CommitId::new(oid))
    }
}

pub fn get_commit(repo: &Repository, id: CommitId) -> StorageResult<CommitInfo> {
    let commit = repo
        .find_commit(id.raw())
        .map_err(|_| StorageError::CommitNotFound(id.to_string()))?;
    Ok(CommitInfo::from_git2(&commit))
}

pub fn get_tree_at_commit(repo: &Repository, commit_id: CommitId) -> StorageResult<TreeHandle<'_>> {
    let commit = repo
        .find_commit(commit_id.raw())
        .map_err(|_| StorageError::CommitNotFound(commit_id.to_string()))?;
    Ok(TreeHandle::new(commit.tree()?))
}

/// Root commit of a new store, holding only the store metadata.
pub fn create_initial_commit(
    repo: &Repository,
    signature: &GitSignature,
    meta_blob: BlobId,
) -> StorageResult<CommitId> {
    let tree_id = crate::storage::tree::create_initial_tree(repo, meta_blob)?;

    CommitBuilder::new(repo)
        .tree(tree_id)
        .message(CommitMessage::initialize())
        .signature(signature.clone())
        .commit()
}

/// Paths changed between two commits.
pub fn diff_commits(repo: &Repository, old: CommitId, new: CommitId) -> StorageResult<Vec<Change>> {
    let old_tree = repo.find_commit(old.raw())?.tree()?;
    let new_tree = repo.find_commit(new.raw())?.tree()?;

    let mut opts = DiffOptions::new();
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;

    Ok(extract_changes_from_diff(&diff))
}

fn extract_changes_from_diff(diff: &Diff<'_>) -> Vec<Change> {
    diff.deltas()
        .map(|delta| {
            let path = delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(PathBuf::from)
                .unwrap_or_default();

            let status = match delta.status() {
                Delta::Added => ChangeStatus::Added,
                Delta::Deleted => ChangeStatus::Deleted,
                Delta::Modified => ChangeStatus::Modified,
                Delta::Renamed => ChangeStatus::Renamed,
                Delta::Copied => ChangeStatus::Copied,
                _ => ChangeStatus::Other,
            };

            Change { path, status }
        })
        .collect()
}

/// Walks history newest-first from a starting commit.
pub struct HistoryIterator<'repo> {
    repo: &'repo Repository,
    revwalk: Revwalk<'repo>,
}

impl<'repo> HistoryIterator<'repo> {
    pub fn new(repo: &'repo Repository, start: CommitId) -> StorageResult<Self> {
        let mut revwalk = repo.revwalk()?;
        revwalk.push(start.raw())?;
        revwalk.set_sorting(Sort::TIME | Sort::TOPOLOGICAL)?;
        Ok(Self { repo, revwalk })
    }

    /// Follow first parents only, i.e. the history of `main` itself.
    pub fn first_parent_only(mut self) -> Self {
        self.revwalk.simplify_first_parent().ok();
        self
    }
}

impl Iterator for HistoryIterator<'_> {
    type Item = StorageResult<CommitInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.revwalk.next()? {
            Ok(oid) => match self.repo.find_commit(oid) {
                Ok(commit) => Some(Ok(CommitInfo::from_git2(&commit))),
                Err(e) => Some(Err(StorageError::Git(e))),
            },
            Err(e) => Some(Err(StorageError::Git(e))),
        }
    }
}

pub fn history(repo: &Repository, start: CommitId) -> StorageResult<HistoryIterator<'_>> {
    HistoryIterator::new(repo, start)
}

/// Paths changed on both sides since `base`.
pub fn detect_conflicts(
    repo: &Repository,
    base: CommitId,
    ours: CommitId,
    theirs: CommitId,
) -> StorageResult<Vec<PathBuf>> {
    let our_changes = diff_commits(repo, base, ours)?;
    let their_changes = diff_commits(repo, base, theirs)?;

    let our_paths: HashSet<&PathBuf> = our_changes.iter().map(|c| &c.path).collect();

    Ok(their_changes
        .iter()
        .filter(|c| our_paths.contains(&c.path))
        .map(|c| c.path.clone())
        .collect())
}

/// Commit message formats for store operations.
pub struct CommitMessage;

impl CommitMessage {
    pub fn initialize() -> String {
        "[gitdoc] Initialize store".to_string()
    }

    pub fn insert(collection: &str, id: &str, session_id: Option<&str>) -> String {
        Self::with_session(format!("[INSERT] {}/{}", collection, id), session_id)
    }

    pub fn insert_many(collection: &str, count: usize, session_id: Option<&str>) -> String {
        Self::with_session(format!("[INSERT] {} x{}", collection, count), session_id)
    }

    pub fn delete(collection: &str, id: &str, session_id: Option<&str>) -> String {
        Self::with_session(format!("[DELETE] {}/{}", collection, id), session_id)
    }

    /// Message of the merge commit that lands a session transaction on `main`.
    pub fn session_commit(session_id: &str) -> String {
        format!("[COMMIT] session {} merged to main", session_id)
    }

    fn with_session(message: String, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) => format!("{} session:{}", message, id),
            None => message,
        }
    }
}
