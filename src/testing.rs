//! Test doubles exposed for this crate's own tests and for downstream
//! integration tests that want to drive a [`crate::root::GunRoot`]
//! without a real backing store (cf. teacher's in-memory fixtures used
//! across `freeq-server`'s acceptance tests).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::RwLock;

use crate::error::GunError;
use crate::storage::Storage;

/// An in-memory [`Storage`] backed by a `tokio::sync::RwLock<BTreeMap>`.
/// Per-id linearizability (§6) falls out of the single lock; it is not
/// meant to model any particular production backing store.
pub struct MemStorage {
    nodes: RwLock<BTreeMap<String, Json>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn put(&self, id: &str, node: Json) -> Result<(), GunError> {
        self.nodes.write().await.insert(id.to_string(), node);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Json>, GunError> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn exists(&self, id: &str) -> bool {
        self.nodes.read().await.contains_key(id)
    }

    async fn delete(&self, id: &str) -> Result<(), GunError> {
        self.nodes.write().await.remove(id);
        Ok(())
    }

    async fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, GunError> {
        let nodes = self.nodes.read().await;
        Ok(match prefix {
            Some(p) => nodes.keys().filter(|k| k.starts_with(p)).cloned().collect(),
            None => nodes.keys().cloned().collect(),
        })
    }
}
