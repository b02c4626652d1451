//! Blob operations for document storage.
//!
//! Every document is stored as its own pretty-printed JSON blob. The blob is
//! the document exactly as the caller serialized it; the only field the store
//! interprets is `_id`, which must match the blob's file name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{BlobId, DatabaseName, DocumentId};

/// Name of the id field every document carries.
pub const ID_FIELD: &str = "_id";

/// Store format written into `_meta/store.json`.
pub const STORE_FORMAT: u32 = 1;

/// Extract and validate the `_id` of a serialized document.
pub fn document_id(document: &Value) -> StorageResult<DocumentId> {
    let id = document
        .as_object()
        .and_then(|map| map.get(ID_FIELD))
        .and_then(Value::as_str)
        .ok_or(StorageError::MissingDocumentId)?;
    Ok(DocumentId::new(id)?)
}

/// Serialize a document to blob bytes.
///
/// `serde_json` maps keep their keys sorted, so equal documents always
/// produce identical blobs and git deduplicates them.
pub fn serialize_document(document: &Value) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(document)?)
}

/// Deserialize a document blob, checking its `_id` against the file name.
pub fn deserialize_document(bytes: &[u8], expected_id: &DocumentId) -> StorageResult<Value> {
    let document: Value = serde_json::from_slice(bytes)?;
    let id = document_id(&document).map_err(|_| StorageError::CorruptedData {
        path: expected_id.file_name().into(),
        reason: "document has no valid `_id`".to_string(),
    })?;

    if &id != expected_id {
        return Err(StorageError::CorruptedData {
            path: expected_id.file_name().into(),
            reason: format!(
                "id mismatch: file name suggests '{}' but content has '{}'",
                expected_id, id
            ),
        });
    }

    Ok(document)
}

pub fn write_blob(repo: &git2::Repository, document: &Value) -> StorageResult<BlobId> {
    let bytes = serialize_document(document)?;
    Ok(BlobId::new(repo.blob(&bytes)?))
}

pub fn read_blob(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Vec<u8>> {
    let blob = repo.find_blob(blob_id.raw())?;
    Ok(blob.content().to_vec())
}

/// Contents of `_meta/store.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub database: String,
    pub format: u32,
    pub created_at: String,
}

impl StoreMeta {
    pub fn new(database: &DatabaseName) -> Self {
        Self {
            database: database.as_str().to_string(),
            format: STORE_FORMAT,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn write(&self, repo: &git2::Repository) -> StorageResult<BlobId> {
        let bytes = serde_json::to_vec_pretty(self)?;
        Ok(BlobId::new(repo.blob(&bytes)?))
    }

    pub fn read(repo: &git2::Repository, blob_id: BlobId) -> StorageResult<Self> {
        let bytes = read_blob(repo, blob_id)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
