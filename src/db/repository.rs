//! Generic repositories over one collection.
//!
//! Every operation consults the ambient [`SessionContext`]: inside a
//! transaction it runs bound to the transaction's session, otherwise it runs
//! against committed state.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::client::Collection;
use crate::db::context::DbContext;
use crate::db::error::{DatabaseError, DatabaseResult};
use crate::storage::{CollectionName, DocumentId};
use crate::transaction::{SessionContext, Transaction};

/// A type stored in a fixed collection.
///
/// Its JSON form must be an object with a string `_id` field:
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Product {
///     #[serde(rename = "_id")]
///     id: String,
///     name: String,
/// }
///
/// impl Document for Product {
///     const COLLECTION: &'static str = "products";
/// }
/// ```
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    const COLLECTION: &'static str;
}

/// CRUD over documents of type `T`.
#[async_trait]
pub trait DocumentRepository<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    async fn insert(&self, document: &T) -> DatabaseResult<()>;

    /// Insert all documents in one write. Either all are stored or none.
    async fn insert_many(&self, documents: &[T]) -> DatabaseResult<()>;

    async fn get_by_id(&self, id: &str) -> DatabaseResult<Option<T>>;

    async fn get_all(&self) -> DatabaseResult<Vec<T>>;

    /// Returns the number of documents removed (0 or 1).
    async fn delete_by_id(&self, id: &str) -> DatabaseResult<u64>;

    async fn start_transaction(&self) -> DatabaseResult<Transaction>;
}

/// The default repository, bound to one collection.
pub struct Repository<T> {
    context: DbContext,
    collection: Collection<T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            collection: self.collection.clone(),
        }
    }
}

impl<T: Document> Repository<T> {
    /// Repository over `T::COLLECTION`.
    pub fn new(context: &DbContext) -> DatabaseResult<Self> {
        Self::with_collection(context, T::COLLECTION)
    }
}

impl<T> Repository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Repository over an explicitly named collection.
    pub fn with_collection(context: &DbContext, collection: &str) -> DatabaseResult<Self> {
        Ok(Self {
            context: context.clone(),
            collection: context.collection(collection)?,
        })
    }

    pub fn collection_name(&self) -> &CollectionName {
        self.collection.name()
    }

    pub fn context(&self) -> &DbContext {
        &self.context
    }

    /// First document, in `_id` order, for which `predicate` holds.
    pub async fn first_or_default<P>(&self, predicate: P) -> DatabaseResult<Option<T>>
    where
        P: Fn(&T) -> bool,
    {
        let session = SessionContext::current();
        let documents = self.collection.find_all(session.as_ref()).await?;
        Ok(documents.into_iter().find(|d| predicate(d)))
    }
}

fn parse_id(id: &str) -> DatabaseResult<DocumentId> {
    DocumentId::new(id).map_err(|reason| DatabaseError::InvalidId {
        id: id.to_string(),
        reason,
    })
}

#[async_trait]
impl<T> DocumentRepository<T> for Repository<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn insert(&self, document: &T) -> DatabaseResult<()> {
        let session = SessionContext::current();
        self.collection.insert_one(document, session.as_ref()).await?;
        Ok(())
    }

    async fn insert_many(&self, documents: &[T]) -> DatabaseResult<()> {
        let session = SessionContext::current();
        self.collection.insert_many(documents, session.as_ref()).await?;
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> DatabaseResult<Option<T>> {
        let id = parse_id(id)?;
        let session = SessionContext::current();
        Ok(self.collection.find_by_id(&id, session.as_ref()).await?)
    }

    async fn get_all(&self) -> DatabaseResult<Vec<T>> {
        let session = SessionContext::current();
        Ok(self.collection.find_all(session.as_ref()).await?)
    }

    async fn delete_by_id(&self, id: &str) -> DatabaseResult<u64> {
        let id = parse_id(id)?;
        let session = SessionContext::current();
        Ok(self.collection.delete_one(&id, session.as_ref()).await?)
    }

    async fn start_transaction(&self) -> DatabaseResult<Transaction> {
        Ok(self.context.start_transaction(None, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::DbConfig;
    use crate::transaction::TransactionError;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Product {
        #[serde(rename = "_id")]
        id: String,
        name: String,
        price: u32,
    }

    impl Document for Product {
        const COLLECTION: &'static str = "products";
    }

    fn product(id: &str, price: u32) -> Product {
        Product {
            id: id.to_string(),
            name: format!("product {}", id),
            price,
        }
    }

    async fn repository() -> (TempDir, Repository<Product>) {
        let dir = TempDir::new().unwrap();
        let ctx = DbContext::open_with_config(DbConfig::new(dir.path(), "shop").unwrap())
            .await
            .unwrap();
        (dir, Repository::new(&ctx).unwrap())
    }

    #[tokio::test]
    async fn test_collection_binding() {
        let (_dir, repo) = repository().await;
        assert_eq!(repo.collection_name().as_str(), "products");

        let custom = Repository::<Product>::with_collection(repo.context(), "archive").unwrap();
        assert_eq!(custom.collection_name().as_str(), "archive");

        assert!(Repository::<Product>::with_collection(repo.context(), "_meta").is_err());
    }

    #[tokio::test]
    async fn test_invalid_ids() {
        let (_dir, repo) = repository().await;

        let err = repo.get_by_id("").await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidId { .. }));
        assert!(err.is_usage_error());

        assert!(matches!(
            repo.delete_by_id("../x").await,
            Err(DatabaseError::InvalidId { .. })
        ));
    }

    #[tokio::test]
    async fn test_first_or_default() {
        let (_dir, repo) = repository().await;
        repo.insert_many(&[product("c", 30), product("a", 10), product("b", 20)])
            .await
            .unwrap();

        let found = repo.first_or_default(|p| p.price >= 15).await.unwrap();
        assert_eq!(found, Some(product("b", 20)));

        assert_eq!(repo.first_or_default(|p| p.price > 100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_usable_as_trait_object() {
        let (_dir, repo) = repository().await;
        let repo: Box<dyn DocumentRepository<Product>> = Box::new(repo);

        repo.insert(&product("p1", 5)).await.unwrap();
        assert_eq!(repo.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_transaction_outside_scope() {
        let (_dir, repo) = repository().await;
        let err = repo.start_transaction().await.unwrap_err();
        assert!(matches!(
            err,
            DatabaseError::Transaction(TransactionError::NoSessionScope)
        ));
    }
}
