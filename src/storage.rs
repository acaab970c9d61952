//! The `Storage` capability boundary (§6).
//!
//! The core assumes per-id linearizability and never prescribes the
//! backing store; a real deployment plugs in its own implementation (the
//! SQLite adapter is explicitly out of scope, §1). [`crate::testing::MemStorage`]
//! is the in-memory implementation used by this crate's own tests.

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::error::GunError;

/// `put/get/exists/delete/keys`, each mapped straight onto §6's contract.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn put(&self, id: &str, node: Json) -> Result<(), GunError>;
    async fn get(&self, id: &str) -> Result<Option<Json>, GunError>;
    async fn exists(&self, id: &str) -> bool;
    async fn delete(&self, id: &str) -> Result<(), GunError>;
    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, GunError>;
}
