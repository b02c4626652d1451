//! Branch and reference management.
//!
//! `main` holds committed state. Every session transaction works on its own
//! branch, `session/{session_id}`, forked from `main` when the transaction
//! starts and deleted when it ends.

use git2::{BranchType, ErrorCode, Repository};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BranchName, CommitId};

/// Manages git references (branches).
pub struct RefManager;

impl RefManager {
    pub fn resolve_branch(repo: &Repository, branch: &BranchName) -> StorageResult<CommitId> {
        let reference = repo
            .find_reference(&branch.as_ref_path())
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        let commit = reference
            .peel_to_commit()
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        Ok(CommitId::new(commit.id()))
    }

    /// Current commit of `main`.
    pub fn main_commit(repo: &Repository) -> StorageResult<CommitId> {
        match repo.find_reference(&BranchName::main().as_ref_path()) {
            Ok(reference) => Ok(CommitId::new(reference.peel_to_commit()?.id())),
            Err(e) if e.code() == ErrorCode::NotFound => Err(StorageError::EmptyRepository),
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    pub fn branch_exists(repo: &Repository, branch: &BranchName) -> bool {
        repo.find_reference(&branch.as_ref_path()).is_ok()
    }

    pub fn create_branch(repo: &Repository, branch: &BranchName, target: CommitId) -> StorageResult<()> {
        if Self::branch_exists(repo, branch) {
            return Err(StorageError::BranchAlreadyExists(branch.to_string()));
        }

        let commit = repo.find_commit(target.raw())?;
        repo.branch(branch.as_str(), &commit, false)?;

        Ok(())
    }

    /// Move a branch only if it still points at `expected`.
    ///
    /// The check and the update are a single ref transaction in libgit2, so a
    /// writer in another process cannot slip in between them.
    pub fn update_branch_if_unchanged(
        repo: &Repository,
        branch: &BranchName,
        expected: CommitId,
        new_target: CommitId,
    ) -> StorageResult<()> {
        let log_message = format!("{} -> {}", expected.short(), new_target.short());
        match repo.reference_matching(
            &branch.as_ref_path(),
            new_target.raw(),
            true,
            expected.raw(),
            &log_message,
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.code() == ErrorCode::Modified || e.code() == ErrorCode::NotFound => {
                if Self::branch_exists(repo, branch) {
                    Err(StorageError::ConcurrentModification {
                        branch: branch.to_string(),
                    })
                } else {
                    Err(StorageError::RefNotFound(branch.to_string()))
                }
            }
            Err(e) => Err(StorageError::Git(e)),
        }
    }

    pub fn delete_branch(repo: &Repository, branch: &BranchName) -> StorageResult<()> {
        let mut git_branch = repo
            .find_branch(branch.as_str(), BranchType::Local)
            .map_err(|_| StorageError::RefNotFound(branch.to_string()))?;

        git_branch.delete()?;

        Ok(())
    }

    pub fn list_branches(repo: &Repository, prefix: Option<&str>) -> StorageResult<Vec<BranchName>> {
        let branches = repo.branches(Some(BranchType::Local))?;

        let mut result = Vec::new();
        for branch_result in branches {
            let (branch, _) = branch_result?;
            if let Some(name) = branch.name()? {
                if prefix.is_some_and(|p| !name.starts_with(p)) {
                    continue;
                }
                if let Ok(branch_name) = BranchName::new(name) {
                    result.push(branch_name);
                }
            }
        }

        Ok(result)
    }

    pub fn list_session_branches(repo: &Repository) -> StorageResult<Vec<BranchName>> {
        Self::list_branches(repo, Some(BranchName::SESSION_PREFIX))
    }

    /// Fork a session branch from `base`.
    pub fn create_session_branch(
        repo: &Repository,
        session_id: &str,
        base: CommitId,
    ) -> StorageResult<BranchName> {
        let branch = BranchName::for_session(session_id);
        Self::create_branch(repo, &branch, base)?;
        Ok(branch)
    }

    /// Delete a session branch. Missing branches are not an error.
    pub fn delete_session_branch(repo: &Repository, session_id: &str) -> StorageResult<bool> {
        let branch = BranchName::for_session(session_id);
        match Self::delete_branch(repo, &branch) {
            Ok(()) => Ok(true),
            Err(StorageError::RefNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create `main` at the initial commit and point HEAD at it.
    pub fn init_main_branch(repo: &Repository, initial_commit: CommitId) -> StorageResult<()> {
        let main = BranchName::main();

        if !Self::branch_exists(repo, &main) {
            Self::create_branch(repo, &main, initial_commit)?;
        }

        repo.set_head(&main.as_ref_path())?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::commit::{CommitBuilder, create_initial_commit};
    use crate::storage::types::{BlobId, GitSignature};
    use tempfile::TempDir;

    fn setup_repo_with_commit() -> (TempDir, Repository, CommitId) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        let commit_id = {
            let meta = BlobId::new(repo.blob(b"{}").unwrap());
            create_initial_commit(&repo, &GitSignature::gitdoc(), meta).unwrap()
        };
        RefManager::init_main_branch(&repo, commit_id).unwrap();

        (dir, repo, commit_id)
    }

    fn child_commit(repo: &Repository, parent: CommitId) -> CommitId {
        let tree_id = crate::storage::types::TreeId::new(
            repo.find_commit(parent.raw()).unwrap().tree_id(),
        );
        CommitBuilder::new(repo)
            .tree(tree_id)
            .parent(parent)
            .message("child")
            .commit()
            .unwrap()
    }

    #[test]
    fn test_main_commit() {
        let (_dir, repo, expected) = setup_repo_with_commit();
        assert_eq!(RefManager::main_commit(&repo).unwrap(), expected);
    }

    #[test]
    fn test_main_commit_on_empty_repo() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        assert!(matches!(
            RefManager::main_commit(&repo),
            Err(StorageError::EmptyRepository)
        ));
    }

    #[test]
    fn test_branch_lifecycle() {
        let (_dir, repo, base_commit) = setup_repo_with_commit();
        let branch = BranchName::new("feature").unwrap();

        assert!(!RefManager::branch_exists(&repo, &branch));
        RefManager::create_branch(&repo, &branch, base_commit).unwrap();
        assert!(RefManager::branch_exists(&repo, &branch));
        assert_eq!(RefManager::resolve_branch(&repo, &branch).unwrap(), base_commit);

        let result = RefManager::create_branch(&repo, &branch, base_commit);
        assert!(matches!(result, Err(StorageError::BranchAlreadyExists(_))));

        RefManager::delete_branch(&repo, &branch).unwrap();
        assert!(!RefManager::branch_exists(&repo, &branch));
    }

    #[test]
    fn test_session_branches() {
        let (_dir, repo, base_commit) = setup_repo_with_commit();

        let b1 = RefManager::create_session_branch(&repo, "s001", base_commit).unwrap();
        RefManager::create_session_branch(&repo, "s002", base_commit).unwrap();
        assert_eq!(b1.session_id(), Some("s001"));
        assert_eq!(RefManager::list_session_branches(&repo).unwrap().len(), 2);

        assert!(RefManager::delete_session_branch(&repo, "s001").unwrap());
        assert!(!RefManager::delete_session_branch(&repo, "s001").unwrap());
        assert_eq!(RefManager::list_session_branches(&repo).unwrap().len(), 1);
    }

    #[test]
    fn test_update_branch_if_unchanged() {
        let (_dir, repo, commit1) = setup_repo_with_commit();
        let main = BranchName::main();
        let commit2 = child_commit(&repo, commit1);

        RefManager::update_branch_if_unchanged(&repo, &main, commit1, commit2).unwrap();
        assert_eq!(RefManager::main_commit(&repo).unwrap(), commit2);

        let result = RefManager::update_branch_if_unchanged(&repo, &main, commit1, commit2);
        assert!(matches!(result, Err(StorageError::ConcurrentModification { .. })));
    }

    #[test]
    fn test_update_of_deleted_branch_is_permanent() {
        let (_dir, repo, commit1) = setup_repo_with_commit();
        let commit2 = child_commit(&repo, commit1);
        let branch = RefManager::create_session_branch(&repo, "gone", commit1).unwrap();
        RefManager::delete_session_branch(&repo, "gone").unwrap();

        let err = RefManager::update_branch_if_unchanged(&repo, &branch, commit1, commit2).unwrap_err();
        assert!(matches!(err, StorageError::RefNotFound(_)));
        assert!(!err.is_transient());
        assert!(!RefManager::branch_exists(&repo, &branch));
    }
}
