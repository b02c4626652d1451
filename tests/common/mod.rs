//! Shared fixtures for integration tests.

#![allow(dead_code)]

use gitdoc::db::{DbConfig, DbContext, Document, Repository};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub price: u32,
}

impl Document for Product {
    const COLLECTION: &'static str = "products";
}

pub fn product(id: &str, price: u32) -> Product {
    Product {
        id: id.to_string(),
        name: format!("product {}", id),
        price,
    }
}

pub async fn open(config: impl FnOnce(DbConfig) -> DbConfig) -> (TempDir, DbContext, Repository<Product>) {
    let dir = TempDir::new().unwrap();
    let ctx = DbContext::open_with_config(config(DbConfig::new(dir.path(), "shop").unwrap()))
        .await
        .unwrap();
    let repo = Repository::new(&ctx).unwrap();
    (dir, ctx, repo)
}

pub async fn setup() -> (TempDir, DbContext, Repository<Product>) {
    open(|config| config).await
}

/// Session branches currently present in the store.
pub fn session_branches(ctx: &DbContext) -> usize {
    ctx.client().store().list_session_branches().unwrap().len()
}
