//! Typed collections.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::{Client, ClientSession};
use crate::storage::{CollectionName, DocumentId, GitStore, StorageResult, document_id};

/// A collection of documents of type `T`.
///
/// Every operation takes an optional session. With a session that has a
/// transaction in progress, the operation sees and changes the transaction's
/// snapshot; otherwise it works on committed state.
pub struct Collection<T> {
    client: Client,
    name: CollectionName,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            name: self.name.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub(crate) fn new(client: Client, name: CollectionName) -> Self {
        Self {
            client,
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &CollectionName {
        &self.name
    }

    async fn run<F, R>(&self, session: Option<&ClientSession>, f: F) -> StorageResult<R>
    where
        F: FnOnce(&GitStore, Option<&str>) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        match session {
            Some(session) => session.run(f).await,
            None => self.client.blocking(move |store| f(store, None)).await,
        }
    }

    /// Insert one document. Fails if its `_id` already exists.
    pub async fn insert_one(
        &self,
        document: &T,
        session: Option<&ClientSession>,
    ) -> StorageResult<DocumentId> {
        let value = serde_json::to_value(document)?;
        let id = document_id(&value)?;
        let name = self.name.clone();

        self.run(session, move |store, target| {
            store.insert_documents(&name, &[value], target)
        })
        .await?;

        Ok(id)
    }

    /// Insert documents in one commit. Either all are written or none.
    pub async fn insert_many(
        &self,
        documents: &[T],
        session: Option<&ClientSession>,
    ) -> StorageResult<Vec<DocumentId>> {
        let values = documents
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<Value>, _>>()?;
        let ids = values.iter().map(document_id).collect::<StorageResult<Vec<_>>>()?;
        let name = self.name.clone();

        self.run(session, move |store, target| {
            store.insert_documents(&name, &values, target)
        })
        .await?;

        Ok(ids)
    }

    pub async fn find_by_id(
        &self,
        id: &DocumentId,
        session: Option<&ClientSession>,
    ) -> StorageResult<Option<T>> {
        let name = self.name.clone();
        let id = id.clone();

        let value = self
            .run(session, move |store, target| store.read_document(&name, &id, target))
            .await?;

        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// All documents, ordered by `_id`.
    pub async fn find_all(&self, session: Option<&ClientSession>) -> StorageResult<Vec<T>> {
        let name = self.name.clone();

        let values = self
            .run(session, move |store, target| store.scan_collection(&name, target))
            .await?;

        values
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    /// Delete one document. Returns the number removed (0 or 1).
    pub async fn delete_one(
        &self,
        id: &DocumentId,
        session: Option<&ClientSession>,
    ) -> StorageResult<u64> {
        let name = self.name.clone();
        let id = id.clone();

        let removed = self
            .run(session, move |store, target| store.delete_document(&name, &id, target))
            .await?;

        Ok(u64::from(removed))
    }

    pub async fn count(&self, session: Option<&ClientSession>) -> StorageResult<usize> {
        let name = self.name.clone();
        self.run(session, move |store, target| {
            Ok(store.scan_collection(&name, target)?.len())
        })
        .await
    }
}
