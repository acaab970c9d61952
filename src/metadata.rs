//! C2 — Metadata Manager (§4.2).
//!
//! Injects/validates the `_` envelope on every node and is the entry point
//! for `mergeNodes`, `validate`, `toWire`/`fromWire` pass-through.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use serde_json::Value as Json;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::clock::ProcessClock;
use crate::node::{Envelope, Node, ValidationError, Value};

/// Per-key mutual exclusion for the get -> merge -> put sequence every
/// writer (local `put` or an incoming peer `put`) runs against Storage
/// (§5 "Shared resources": "the Metadata Manager reads-modifies-writes
/// under a per-key mutual-exclusion; different keys may proceed in
/// parallel"). Shared by [`crate::root::GunRoot`] and every
/// [`crate::peer::Peer`] it owns, so a local write and an incoming put to
/// the same node id serialize against each other rather than racing.
#[derive(Default)]
pub struct KeyedLocks {
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    /// Acquires the lock for `node_id`, creating it on first use. Hold the
    /// returned guard for the full get -> merge -> put sequence; dropping
    /// it releases the key for the next writer.
    pub async fn lock(&self, node_id: &str) -> OwnedMutexGuard<()> {
        let entry = self
            .locks
            .lock()
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        entry.lock_owned().await
    }
}

/// Injects/validates envelopes; owns no state of its own — every method
/// takes the clock and any prior node explicitly (§4.2).
pub struct MetadataManager;

impl MetadataManager {
    /// `addMetadata(nodeId, data, existing?) -> node`: existing timestamps
    /// are kept for unchanged fields, fresh ones assigned for new/changed
    /// fields (§4.2, §4.1's timestamp-generation rule).
    pub fn add_metadata(
        clock: &dyn ProcessClock,
        node_id: &str,
        data: BTreeMap<String, Value>,
        existing: Option<&Node>,
    ) -> Node {
        let mut timestamps = BTreeMap::new();
        for (field, value) in &data {
            let prior_ts = existing.and_then(|n| n.envelope.timestamps.get(field).copied());
            let prior_value = existing.and_then(|n| n.fields.get(field));
            let ts = if prior_value == Some(value) {
                // Unchanged field: keep its prior timestamp if one exists.
                prior_ts.unwrap_or_else(|| clock.next_timestamp(None))
            } else {
                clock.next_timestamp(prior_ts)
            };
            timestamps.insert(field.clone(), ts);
        }
        // Fields present on `existing` but absent from `data` are dropped
        // by this call (the core never deletes fields implicitly — callers
        // that want deletion pass an explicit null value, which is itself
        // a normal field mutation under §4.1).
        Node {
            id: node_id.to_string(),
            fields: data,
            envelope: Envelope {
                node_id: node_id.to_string(),
                timestamps,
                machine: clock.next_machine(),
                machine_id: clock.machine_id().to_string(),
            },
        }
    }

    /// §4.1 merge, delegated to `Node::merge`.
    pub fn merge_nodes(clock: &dyn ProcessClock, current: &Node, incoming: &Node) -> Node {
        Node::merge(current, incoming, (clock.machine_id(), clock.next_machine()))
    }

    pub fn validate(node: &Node) -> Result<(), Vec<ValidationError>> {
        node.validate()
    }

    pub fn to_wire(node: &Node) -> Json {
        node.to_wire()
    }

    pub fn from_wire(node_id: &str, obj: &Json) -> Option<Node> {
        Node::from_wire(node_id, obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn add_metadata_assigns_fresh_timestamps_for_new_node() {
        let clock = FakeClock::new(1000);
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), Value::String("Alice".into()));
        data.insert("age".to_string(), Value::Number(30.0));
        let node = MetadataManager::add_metadata(&clock, "users/alice", data, None);
        assert_eq!(node.envelope.node_id, "users/alice");
        assert_eq!(node.envelope.timestamps["name"], 1000);
        assert_eq!(node.envelope.timestamps["age"], 1000);
        assert!(node.validate().is_ok());
    }

    #[test]
    fn add_metadata_keeps_timestamp_for_unchanged_field_only() {
        let clock = FakeClock::new(1000);
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), Value::String("Alice".into()));
        let existing = MetadataManager::add_metadata(&clock, "users/alice", data.clone(), None);

        clock.advance(500);
        data.insert("age".to_string(), Value::Number(31.0));
        let updated = MetadataManager::add_metadata(&clock, "users/alice", data, Some(&existing));
        assert_eq!(updated.envelope.timestamps["name"], 1000);
        assert_eq!(updated.envelope.timestamps["age"], 1500);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key_but_not_different_keys() {
        let locks = Arc::new(KeyedLocks::new());
        let order = Arc::new(SyncMutex::new(Vec::new()));

        let l1 = locks.clone();
        let o1 = order.clone();
        let a = tokio::spawn(async move {
            let _guard = l1.lock("users/alice").await;
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            o1.lock().push("alice-1");
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let l2 = locks.clone();
        let o2 = order.clone();
        let b = tokio::spawn(async move {
            // Same key as `a`; must wait for `a`'s guard to drop.
            let _guard = l2.lock("users/alice").await;
            o2.lock().push("alice-2");
        });
        let l3 = locks.clone();
        let o3 = order.clone();
        let c = tokio::spawn(async move {
            // Different key; must not be blocked by `a`'s held guard.
            let _guard = l3.lock("users/bob").await;
            o3.lock().push("bob");
        });

        tokio::try_join!(a, b, c).unwrap();
        let order = order.lock();
        assert_eq!(order.iter().position(|e| *e == "bob"), Some(0));
        assert_eq!(*order, vec!["bob", "alice-1", "alice-2"]);
    }
}
