//! C12 — Chain API (§4.12).
//!
//! A lightweight handle `(rootRef, path[])` referencing the owning
//! [`crate::root::GunRoot`] by shared lifetime. Never outlives its Root.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::error::GunError;
use crate::event::Event;
use crate::node::{Node, Value};
use crate::query::{FilterFn, MapFn, QueryTransforms};
use crate::root::GunRoot;

/// Releases its subscription slot on drop (§4.12 `on`'s cancellation
/// contract); holding this alive keeps the listener registered. Dropping
/// it closes the cancel channel, which the listener task selects on.
pub struct Subscription {
    _cancel: tokio::sync::oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct Chain {
    root: Arc<GunRoot>,
    root_ref: String,
    path: Vec<String>,
    transforms: QueryTransforms,
}

impl Chain {
    pub fn new(root: Arc<GunRoot>, root_ref: impl Into<String>) -> Self {
        Self {
            root,
            root_ref: root_ref.into(),
            path: Vec::new(),
            transforms: QueryTransforms::default(),
        }
    }

    /// `get(seg)`: returns a new handle with `path + seg`.
    pub fn get(&self, segment: impl Into<String>) -> Chain {
        let mut path = self.path.clone();
        path.push(segment.into());
        Chain {
            root: self.root.clone(),
            root_ref: self.root_ref.clone(),
            path,
            transforms: self.transforms.clone(),
        }
    }

    pub fn map(&self, f: MapFn) -> Chain {
        let mut next = self.clone();
        next.transforms.map = Some(f);
        next
    }

    pub fn filter(&self, f: FilterFn) -> Chain {
        let mut next = self.clone();
        next.transforms.filter = Some(f);
        next
    }

    fn terminal_id(&self) -> String {
        if self.path.is_empty() {
            self.root_ref.clone()
        } else {
            format!("{}/{}", self.root_ref, self.path.join("/"))
        }
    }

    /// `put(data)`: Flattener -> Metadata -> Storage write -> `Put` event
    /// -> broadcast to peers/relays. Returns the same handle for chaining.
    pub async fn put(&self, data: serde_json::Value) -> Result<Chain, GunError> {
        self.root.write_node(&self.terminal_id(), data).await?;
        Ok(self.clone())
    }

    /// `set(data)`: `put` under a fresh opaque 16-char child id.
    pub async fn set(&self, data: serde_json::Value) -> Result<Chain, GunError> {
        let child_id = crate::id::random_id(16);
        self.get(child_id).put(data).await
    }

    /// `once()`: resolves the current value, or the null result.
    pub async fn once(&self) -> Result<Option<serde_json::Value>, GunError> {
        let node = self
            .root
            .query_engine()
            .once(
                self.root.network_dispatch(),
                &self.root_ref,
                &self.path,
                &self.transforms,
                Duration::from_secs(30),
            )
            .await?;
        Ok(node.map(node_to_json))
    }

    /// `on(listener)`: delivers every subsequent change for the terminal
    /// node. The returned [`Subscription`] releases its slot on drop.
    pub fn on<F>(&self, mut listener: F) -> Subscription
    where
        F: FnMut(serde_json::Value) + Send + 'static,
    {
        let terminal_id = self.terminal_id();
        let mut receiver = self.root.events().subscribe();
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => break,
                    msg = receiver.recv() => match msg {
                        Ok(Event::Put { node_id, node }) if node_id == terminal_id => {
                            listener(node_to_json(node));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        Subscription { _cancel: cancel_tx }
    }
}

fn node_to_json(node: Node) -> serde_json::Value {
    let mut obj = serde_json::Map::new();
    for (k, v) in &node.fields {
        obj.insert(k.clone(), value_to_json(v));
    }
    obj.insert("_".into(), serde_json::to_value(&node.envelope).unwrap_or(serde_json::Value::Null));
    serde_json::Value::Object(obj)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::testing::MemStorage;

    fn test_root() -> Arc<GunRoot> {
        GunRoot::new_standalone(Arc::new(MemStorage::new()), Arc::new(SystemClock::new()))
    }

    #[tokio::test]
    async fn put_then_once_round_trips_fields() {
        let root = test_root();
        let chain = Chain::new(root, "users/alice");
        chain
            .put(serde_json::json!({"name": "Alice", "age": 30}))
            .await
            .unwrap();

        let value = chain.once().await.unwrap().unwrap();
        assert_eq!(value["name"], "Alice");
        assert_eq!(value["age"], 30.0);
        assert_eq!(value["_"]["#"], "users/alice");
    }

    #[tokio::test]
    async fn once_on_missing_node_is_null() {
        let root = test_root();
        let chain = Chain::new(root, "users/nobody");
        assert!(chain.once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_creates_a_fresh_child_id_each_time() {
        let root = test_root();
        let chain = Chain::new(root, "users");
        let a = chain.set(serde_json::json!({"name": "A"})).await.unwrap();
        let b = chain.set(serde_json::json!({"name": "B"})).await.unwrap();
        assert_ne!(a.terminal_id(), b.terminal_id());
    }
}
