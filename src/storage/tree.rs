//! Tree operations for collection management.
//!
//! In git a tree is a directory. In a gitdoc store:
//! - the root tree holds one directory per collection plus `_meta`
//! - each collection directory holds one JSON blob per document
//!
//! Collections are implicit: a collection directory appears with its first
//! document and disappears with its last one (git does not keep empty trees
//! around in practice, so neither do we).

use std::collections::HashMap;

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder as Git2TreeBuilder};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, CollectionName, DocumentId, DocumentPath, TreeId};

/// Directory holding store metadata.
pub const META_DIR: &str = "_meta";

/// Store metadata file inside [`META_DIR`].
pub const META_FILE: &str = "store.json";

/// A read-only snapshot of the root tree at one commit.
#[derive(Debug)]
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    pub fn id(&self) -> TreeId {
        TreeId::new(self.tree.id())
    }

    pub(crate) fn inner(&self) -> &Tree<'repo> {
        &self.tree
    }

    /// All collections (top-level directories that are not store metadata).
    pub fn list_collections(&self) -> Vec<CollectionName> {
        self.tree
            .iter()
            .filter_map(|entry| {
                if entry.kind() != Some(ObjectType::Tree) {
                    return None;
                }
                let name = entry.name()?;
                if name.starts_with('_') {
                    return None;
                }
                CollectionName::new(name).ok()
            })
            .collect()
    }

    pub fn collection_exists(&self, collection: &CollectionName) -> bool {
        self.tree
            .get_name(collection.as_str())
            .map(|entry| entry.kind() == Some(ObjectType::Tree))
            .unwrap_or(false)
    }

    fn collection_tree(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
    ) -> StorageResult<Option<Tree<'repo>>> {
        match self.tree.get_name(collection.as_str()) {
            Some(entry) => {
                if entry.kind() != Some(ObjectType::Tree) {
                    return Err(StorageError::UnexpectedEntryType {
                        path: collection.as_str().into(),
                        expected: "tree (directory)".to_string(),
                        found: format!("{:?}", entry.kind()),
                    });
                }
                Ok(Some(repo.find_tree(entry.id())?))
            }
            None => Ok(None),
        }
    }

    /// Document ids in a collection, sorted. A missing collection is empty.
    pub fn list_documents(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
    ) -> StorageResult<Vec<DocumentId>> {
        let Some(tree) = self.collection_tree(repo, collection)? else {
            return Ok(Vec::new());
        };

        let mut ids: Vec<DocumentId> = tree
            .iter()
            .filter_map(|entry| {
                if entry.kind() != Some(ObjectType::Blob) {
                    return None;
                }
                let id = entry.name()?.strip_suffix(".json")?;
                DocumentId::new(id).ok()
            })
            .collect();
        ids.sort();

        Ok(ids)
    }

    pub fn document_blob_id(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
        id: &DocumentId,
    ) -> StorageResult<Option<BlobId>> {
        let Some(tree) = self.collection_tree(repo, collection)? else {
            return Ok(None);
        };

        let Some(entry) = tree.get_name(&id.file_name()) else {
            return Ok(None);
        };
        if entry.kind() != Some(ObjectType::Blob) {
            return Err(StorageError::UnexpectedEntryType {
                path: DocumentPath::new(collection.clone(), id.clone()).to_path_buf(),
                expected: "blob (file)".to_string(),
                found: format!("{:?}", entry.kind()),
            });
        }
        let blob_id = BlobId::new(entry.id());
        Ok(Some(blob_id))
    }

    pub fn document_exists(
        &self,
        repo: &'repo Repository,
        collection: &CollectionName,
        id: &DocumentId,
    ) -> StorageResult<bool> {
        Ok(self.document_blob_id(repo, collection, id)?.is_some())
    }

    /// Blob id of `_meta/store.json`, if present.
    pub fn meta_blob_id(&self) -> Option<BlobId> {
        let path = format!("{}/{}", META_DIR, META_FILE);
        self.tree
            .get_path(std::path::Path::new(&path))
            .ok()
            .filter(|entry| entry.kind() == Some(ObjectType::Blob))
            .map(|entry| BlobId::new(entry.id()))
    }
}

/// Accumulates document changes on top of a tree and writes a new tree.
///
/// The source tree is never modified.
///
/// ```ignore
/// let mut mutator = TreeMutator::from_tree(repo, &tree)?;
/// mutator.upsert_document(&products, &id, blob_id)?;
/// mutator.remove_document(&products, &other)?;
/// let new_tree_id = mutator.write()?;
/// ```
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    root_builder: Git2TreeBuilder<'repo>,
    /// Builders for collections touched so far.
    modified: HashMap<String, Git2TreeBuilder<'repo>>,
    /// Tree ids of collections present in the source tree.
    original: HashMap<String, git2::Oid>,
}

impl<'repo> TreeMutator<'repo> {
    pub fn from_tree(repo: &'repo Repository, tree: &TreeHandle<'_>) -> StorageResult<Self> {
        let root_builder = repo.treebuilder(Some(tree.inner()))?;

        let mut original = HashMap::new();
        for entry in tree.inner().iter() {
            if entry.kind() == Some(ObjectType::Tree) {
                if let Some(name) = entry.name() {
                    original.insert(name.to_string(), entry.id());
                }
            }
        }

        Ok(Self {
            repo,
            root_builder,
            modified: HashMap::new(),
            original,
        })
    }

    pub fn empty(repo: &'repo Repository) -> StorageResult<Self> {
        Ok(Self {
            repo,
            root_builder: repo.treebuilder(None)?,
            modified: HashMap::new(),
            original: HashMap::new(),
        })
    }

    fn collection_builder(&mut self, collection: &str) -> StorageResult<&mut Git2TreeBuilder<'repo>> {
        if !self.modified.contains_key(collection) {
            let builder = match self.original.get(collection) {
                Some(original_id) => {
                    let original_tree = self.repo.find_tree(*original_id)?;
                    self.repo.treebuilder(Some(&original_tree))?
                }
                None => self.repo.treebuilder(None)?,
            };
            self.modified.insert(collection.to_string(), builder);
        }
        self.modified
            .get_mut(collection)
            .ok_or_else(|| StorageError::Internal(format!("no builder for {}", collection)))
    }

    /// Insert or replace a document, creating its collection if needed.
    pub fn upsert_document(
        &mut self,
        collection: &CollectionName,
        id: &DocumentId,
        blob_id: BlobId,
    ) -> StorageResult<()> {
        let builder = self.collection_builder(collection.as_str())?;
        builder.insert(id.file_name(), blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// Remove a document. Returns whether it was present.
    pub fn remove_document(
        &mut self,
        collection: &CollectionName,
        id: &DocumentId,
    ) -> StorageResult<bool> {
        if !self.modified.contains_key(collection.as_str())
            && !self.original.contains_key(collection.as_str())
        {
            return Ok(false);
        }

        let builder = self.collection_builder(collection.as_str())?;
        let file_name = id.file_name();
        if builder.get(file_name.as_str())?.is_none() {
            return Ok(false);
        }
        builder.remove(file_name.as_str())?;
        Ok(true)
    }

    /// Write the store metadata blob.
    pub fn set_meta(&mut self, blob_id: BlobId) -> StorageResult<()> {
        let builder = self.collection_builder(META_DIR)?;
        builder.insert(META_FILE, blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// Write all touched collections and return the new root tree id.
    pub fn write(mut self) -> StorageResult<TreeId> {
        for (name, builder) in self.modified {
            if builder.len() == 0 {
                if self.root_builder.get(name.as_str())?.is_some() {
                    self.root_builder.remove(name.as_str())?;
                }
                continue;
            }
            let tree_id = builder.write()?;
            self.root_builder.insert(name.as_str(), tree_id, FileMode::Tree.into())?;
        }

        Ok(TreeId::new(self.root_builder.write()?))
    }
}

/// The root tree of a fresh store: only `_meta/store.json`.
pub fn create_initial_tree(repo: &Repository, meta_blob: BlobId) -> StorageResult<TreeId> {
    let mut mutator = TreeMutator::empty(repo)?;
    mutator.set_meta(meta_blob)?;
    mutator.write()
}
