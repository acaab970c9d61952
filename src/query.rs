//! C11 — Query Engine (§4.11).
//!
//! Builds wire `get` queries, dispatches them to the relay pool and
//! connected peers, resolves locally from Storage, and merges the
//! results via HAM. A query never fails hard on missing data — absence
//! is a legitimate "null" result in this ecosystem's semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::codec::Message;
use crate::error::{ErrorHandler, GunError};
use crate::node::{Node, Value};
use crate::storage::Storage;
use crate::tracker::Tracker;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve `(rootId, path[])` against Storage only, following each path
/// segment as a link field on the previous node (§4.11's traversal
/// example: `get("users").get("alice")` follows the `alice` *field* of
/// the `users` node, not a literal node id).
pub async fn resolve_local(storage: &dyn Storage, root_id: &str, path: &[String]) -> Result<Option<Node>, GunError> {
    let mut current_id = root_id.to_string();
    let mut node = match storage.get(&current_id).await? {
        Some(raw) => Node::from_wire(&current_id, &raw),
        None => None,
    };

    for segment in path {
        let Some(n) = &node else { return Ok(None) };
        let Some(link_target) = n.fields.get(segment).and_then(|v| v.as_link()) else {
            return Ok(None);
        };
        current_id = link_target.to_string();
        node = match storage.get(&current_id).await? {
            Some(raw) => Node::from_wire(&current_id, &raw),
            None => None,
        };
    }
    Ok(node)
}

/// A filter/map transform applied at delivery time, in the order
/// `filter` -> `map` (§4.11). A failing function converts the result
/// into an `Unknown` error but never retries. Both operate on a *child*
/// of a mapping node, not the node itself (§4.12): a mapping node's
/// fields are links, and `filter`/`map` are run against each resolved
/// link target in turn.
pub type FilterFn = Arc<dyn Fn(&Node) -> bool + Send + Sync>;
pub type MapFn = Arc<dyn Fn(Node) -> Result<Node, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct QueryTransforms {
    pub filter: Option<FilterFn>,
    pub map: Option<MapFn>,
}

impl QueryTransforms {
    /// Resolves the terminal node's link fields (its children) and runs
    /// `filter` then `map` against each resolved child (§4.12). Non-link
    /// fields and a node whose children are never requested (no filter/map
    /// set) pass through untouched. A child that fails `filter` is dropped
    /// from the result entirely; a link pointing at a missing child is
    /// likewise dropped (there is nothing to filter/map).
    pub async fn apply(&self, storage: &dyn Storage, node: Option<Node>) -> Result<Option<Node>, GunError> {
        let Some(node) = node else { return Ok(None) };
        if self.filter.is_none() && self.map.is_none() {
            return Ok(Some(node));
        }

        let mut fields = std::collections::BTreeMap::new();
        let mut timestamps = std::collections::BTreeMap::new();

        for (key, value) in &node.fields {
            let Some(child_id) = value.as_link() else {
                // Only a mapping node's children (link fields) are in scope
                // for filter/map; scalar fields on the node itself pass through.
                fields.insert(key.clone(), value.clone());
                if let Some(ts) = node.envelope.timestamps.get(key) {
                    timestamps.insert(key.clone(), *ts);
                }
                continue;
            };

            let child = match storage.get(child_id).await? {
                Some(raw) => Node::from_wire(child_id, &raw),
                None => None,
            };
            let Some(child) = child else { continue };

            if let Some(f) = &self.filter {
                if !f(&child) {
                    continue;
                }
            }

            let target_id = if let Some(m) = &self.map {
                match m(child) {
                    Ok(mapped) => mapped.id,
                    Err(reason) => return Err(GunError::new(crate::error::ErrorKind::Unknown, reason)),
                }
            } else {
                child.id
            };

            fields.insert(key.clone(), Value::link(target_id));
            if let Some(ts) = node.envelope.timestamps.get(key) {
                timestamps.insert(key.clone(), *ts);
            }
        }

        Ok(Some(Node {
            id: node.id,
            fields,
            envelope: crate::node::Envelope { timestamps, ..node.envelope },
        }))
    }
}

/// A sender capable of dispatching a wire `get` to the network (relay
/// pool and/or connected peers) and awaiting a reply, decoupled from the
/// concrete Relay Pool / Peer set so the Query Engine stays testable.
#[async_trait::async_trait]
pub trait NetworkDispatch: Send + Sync {
    async fn dispatch_get(&self, wire: serde_json::Value, timeout: Duration) -> Result<Option<serde_json::Value>, GunError>;
}

struct PendingQuery {
    _cancel_tx: oneshot::Sender<()>,
}

/// Tracks in-flight `once`/`on` queries by id (§4.11).
pub struct QueryEngine {
    storage: Arc<dyn Storage>,
    tracker: Arc<Tracker>,
    errors: Arc<ErrorHandler>,
    pending: Mutex<HashMap<String, PendingQuery>>,
}

impl QueryEngine {
    pub fn new(storage: Arc<dyn Storage>, tracker: Arc<Tracker>, errors: Arc<ErrorHandler>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            tracker,
            errors,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// §4.11 execution order for `once`: (a) relay pool, (b) connected
    /// peers, (c) local storage; merged via HAM. Exactly one callback
    /// invocation results (success, resolved-null, or error) — modeled
    /// here as the `Result<Option<Node>, GunError>` return value.
    pub async fn once(
        self: &Arc<Self>,
        network: Option<&dyn NetworkDispatch>,
        root_id: &str,
        path: &[String],
        transforms: &QueryTransforms,
        timeout: Duration,
    ) -> Result<Option<Node>, GunError> {
        let query_id = crate::id::random_id(8);
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        self.pending.lock().insert(query_id.clone(), PendingQuery { _cancel_tx: cancel_tx });

        let wire = Message::get(root_id, path, query_id.clone()).to_wire();

        let network_result = if let Some(net) = network {
            tokio::select! {
                res = net.dispatch_get(wire, timeout) => {
                    match res {
                        Ok(v) => v,
                        Err(err) => {
                            // §4.11: timeouts never fail hard — absence is legitimate.
                            if err.kind != crate::error::ErrorKind::Timeout {
                                self.errors.handle(err);
                            }
                            None
                        }
                    }
                }
                _ = &mut cancel_rx => {
                    self.pending.lock().remove(&query_id);
                    return Err(GunError::cancelled(&query_id));
                }
            }
        } else {
            None
        };

        self.pending.lock().remove(&query_id);

        let network_node = network_result.and_then(|v| Node::from_wire(root_id, &v));
        let local_node = resolve_local(self.storage.as_ref(), root_id, path).await?;

        let merged = match (local_node, network_node) {
            (Some(local), Some(incoming)) => {
                Some(Node::merge(&local, &incoming, (local.envelope.machine_id.as_str(), local.envelope.machine)))
            }
            (Some(local), None) => Some(local),
            (None, Some(incoming)) => Some(incoming),
            (None, None) => None,
        };

        transforms.apply(self.storage.as_ref(), merged).await
    }

    pub fn cancel(&self, query_id: &str) {
        self.pending.lock().remove(query_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Snapshot of currently in-flight query ids, so a shutdown sequence
    /// can cancel every pending `once`/`on` query (§5 shutdown ordering).
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemStorage;

    fn node_json(id: &str, field: &str, value: &str, ts: u64) -> serde_json::Value {
        serde_json::json!({
            field: value,
            "_": {"#": id, ">": {field: ts}, "machine": 1, "machineId": "AAAA0000"}
        })
    }

    #[tokio::test]
    async fn once_resolves_locally_when_no_network() {
        let storage = Arc::new(MemStorage::new());
        storage.put("users/alice", node_json("users/alice", "name", "Alice", 1000)).await.unwrap();
        let tracker = Tracker::new(100);
        let errors = Arc::new(ErrorHandler::new());
        let engine = QueryEngine::new(storage.clone(), tracker, errors);

        let result = engine
            .once(None, "users/alice", &[], &QueryTransforms::default(), Duration::from_secs(1))
            .await
            .unwrap();
        let node = result.unwrap();
        assert_eq!(node.fields["name"], crate::node::Value::String("Alice".into()));
    }

    #[tokio::test]
    async fn once_resolves_null_when_absent_everywhere() {
        let storage = Arc::new(MemStorage::new());
        let tracker = Tracker::new(100);
        let errors = Arc::new(ErrorHandler::new());
        let engine = QueryEngine::new(storage, tracker, errors);
        let result = engine
            .once(None, "nope", &[], &QueryTransforms::default(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn traversal_follows_link_field_by_name() {
        let storage = Arc::new(MemStorage::new());
        let mut users = serde_json::Map::new();
        users.insert("alice".into(), serde_json::json!({"#": "users/alice"}));
        users.insert(
            "_".into(),
            serde_json::json!({"#": "users", ">": {"alice": 1000}, "machine": 1, "machineId": "AAAA0000"}),
        );
        storage.put("users", serde_json::Value::Object(users)).await.unwrap();
        storage.put("users/alice", node_json("users/alice", "name", "Alice", 1000)).await.unwrap();

        let resolved = resolve_local(storage.as_ref(), "users", &["alice".to_string()]).await.unwrap();
        assert_eq!(resolved.unwrap().id, "users/alice");
    }

    #[tokio::test]
    async fn filter_transform_operates_on_resolved_children_not_the_node() {
        let storage = Arc::new(MemStorage::new());
        let mut users = serde_json::Map::new();
        users.insert("alice".into(), serde_json::json!({"#": "users/alice"}));
        users.insert("bob".into(), serde_json::json!({"#": "users/bob"}));
        users.insert(
            "_".into(),
            serde_json::json!({"#": "users", ">": {"alice": 1000, "bob": 1000}, "machine": 1, "machineId": "AAAA0000"}),
        );
        storage.put("users", serde_json::Value::Object(users)).await.unwrap();
        storage.put("users/alice", node_json("users/alice", "name", "Alice", 1000)).await.unwrap();
        storage.put("users/bob", node_json("users/bob", "name", "Bob", 1000)).await.unwrap();

        let tracker = Tracker::new(100);
        let errors = Arc::new(ErrorHandler::new());
        let engine = QueryEngine::new(storage.clone(), tracker, errors);

        // The "users" node itself has no "name" field — this only passes if
        // filter is evaluated against each resolved child, not the node.
        let mut transforms = QueryTransforms::default();
        transforms.filter = Some(Arc::new(|child: &Node| {
            matches!(child.fields.get("name"), Some(Value::String(n)) if n.starts_with('A'))
        }));

        let result = engine
            .once(None, "users", &[], &transforms, Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();

        assert!(result.fields.contains_key("alice"));
        assert!(!result.fields.contains_key("bob"));
    }
}
