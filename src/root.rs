//! C14 — Gun Root (§3 "Ownership", §5 shutdown ordering).
//!
//! Exclusively owns Storage, the Peer set, the Relay Pool, Mesh
//! Discovery, and the event bus. Chain API values are handles that
//! reference the Root by shared lifetime; they must not outlive it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::broadcast;

use crate::clock::ProcessClock;
use crate::codec::Message;
use crate::error::{ErrorHandler, ErrorKind, GunError};
use crate::event::Event;
use crate::flatten;
use crate::mesh::MeshDiscovery;
use crate::metadata::{KeyedLocks, MetadataManager};
use crate::node::Node;
use crate::peer::Peer;
use crate::query::{NetworkDispatch, QueryEngine};
use crate::relay::RelayPool;
use crate::storage::Storage;
use crate::transport::Transport;

pub struct GunRoot {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn ProcessClock>,
    our_pid: String,
    errors: Arc<ErrorHandler>,
    events: broadcast::Sender<Event>,
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    relay_pool: Mutex<Option<Arc<RelayPool>>>,
    mesh: Mutex<Option<Arc<MeshDiscovery>>>,
    query_engine: Arc<QueryEngine>,
    key_locks: Arc<KeyedLocks>,
}

impl GunRoot {
    /// Full construction with an injected clock, mainly so tests can use
    /// [`crate::clock::FakeClock`] without reaching through every layer.
    pub fn new_standalone(storage: Arc<dyn Storage>, clock: Arc<dyn ProcessClock>) -> Arc<Self> {
        let our_pid = clock.machine_id().to_string();
        let errors = Arc::new(ErrorHandler::new());
        let (events, _rx) = crate::event::channel();
        let query_engine = QueryEngine::new(storage.clone(), crate::tracker::Tracker::new(1000), errors.clone());
        Arc::new(Self {
            storage,
            clock,
            our_pid,
            errors,
            events,
            peers: Mutex::new(HashMap::new()),
            relay_pool: Mutex::new(None),
            mesh: Mutex::new(None),
            query_engine,
            key_locks: Arc::new(KeyedLocks::new()),
        })
    }

    pub fn new(storage: Arc<dyn Storage>) -> Arc<Self> {
        Self::new_standalone(storage, Arc::new(crate::clock::SystemClock::new()))
    }

    pub fn events(&self) -> &broadcast::Sender<Event> {
        &self.events
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn query_engine(&self) -> Arc<QueryEngine> {
        self.query_engine.clone()
    }

    pub fn network_dispatch(&self) -> Option<&dyn NetworkDispatch> {
        Some(self)
    }

    pub fn set_relay_pool(&self, pool: Arc<RelayPool>) {
        *self.relay_pool.lock() = Some(pool);
    }

    pub fn set_mesh(&self, mesh: Arc<MeshDiscovery>) {
        *self.mesh.lock() = Some(mesh);
    }

    /// Connects a transport, performs the handshake, and registers the
    /// resulting Peer under its negotiated id.
    pub async fn add_peer(self: &Arc<Self>, transport: Arc<dyn Transport>) -> Result<Arc<Peer>, GunError> {
        let peer = Peer::new(
            transport,
            self.our_pid.clone(),
            self.storage.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.errors.clone(),
            self.key_locks.clone(),
        );
        let identity = peer.connect().await?;
        self.peers.lock().insert(identity.peer_id, peer.clone());
        Ok(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Flatten -> Metadata -> Storage write -> `Put` event -> broadcast
    /// (§4.12 `put`). `id` is the terminal node id of the Chain handle
    /// issuing the write.
    pub async fn write_node(&self, id: &str, data: Json) -> Result<(), GunError> {
        let flat = flatten::flatten(id, &data);
        for (node_id, fields) in flat {
            // §5 "Shared resources": different keys proceed in parallel, but
            // the get -> merge -> put sequence for one key must not overlap
            // with another writer (local or an incoming peer put) to the
            // same key, or a concurrent merge is silently lost.
            let _guard = self.key_locks.lock(&node_id).await;
            let existing = self
                .storage
                .get(&node_id)
                .await?
                .as_ref()
                .and_then(|raw| Node::from_wire(&node_id, raw));
            let node = MetadataManager::add_metadata(self.clock.as_ref(), &node_id, fields, existing.as_ref());
            node.validate().map_err(|violations| {
                GunError::new(ErrorKind::Validation, format!("write produced an invalid node: {violations:?}"))
                    .with_node(node_id.clone())
            })?;
            self.storage.put(&node_id, node.to_wire()).await?;
            let _ = self.events.send(Event::Put {
                node_id: node_id.clone(),
                node: node.clone(),
            });
            self.broadcast_put(&node_id, &node).await;
        }
        Ok(())
    }

    async fn broadcast_put(&self, node_id: &str, node: &Node) {
        let mut nodes = BTreeMap::new();
        nodes.insert(node_id.to_string(), node.to_wire());
        let wire = Message::put(nodes, crate::id::random_id(8)).to_wire();

        let peers: Vec<Arc<Peer>> = self.peers.lock().values().cloned().collect();
        for peer in peers {
            let _ = peer.transport.send(wire.clone()).await;
        }

        let pool = self.relay_pool.lock().clone();
        if let Some(pool) = pool {
            let _ = pool.send(wire, Duration::from_secs(5)).await;
        }
    }

    /// Shutdown ordering (§5): Chain subscriptions are the caller's
    /// responsibility (dropping a [`crate::chain::Subscription`] cancels
    /// it); this cancels Query Engine work, then Peers, Relay Pool, and
    /// Mesh Discovery, in that order. Storage and the event bus have no
    /// explicit close step and are released when the Root itself drops.
    pub async fn shutdown(&self) {
        for id in self.query_engine.pending_ids() {
            self.query_engine.cancel(&id);
        }

        let peers = std::mem::take(&mut *self.peers.lock());
        for (_, peer) in peers {
            let _ = peer.disconnect().await;
        }

        *self.relay_pool.lock() = None;
        *self.mesh.lock() = None;
    }
}

#[async_trait]
impl NetworkDispatch for GunRoot {
    async fn dispatch_get(&self, wire: Json, timeout: Duration) -> Result<Option<Json>, GunError> {
        if let Some(pool) = self.relay_pool.lock().clone() {
            if let Ok(node_wire) = pool.send(wire.clone(), timeout).await {
                return Ok(Some(node_wire));
            }
        }

        let peers: Vec<Arc<Peer>> = self.peers.lock().values().cloned().collect();
        for peer in peers {
            if let Ok(node_wire) = peer.send_tracked(wire.clone(), timeout).await {
                return Ok(Some(node_wire));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemStorage;

    #[tokio::test]
    async fn write_node_emits_put_event() {
        let root = GunRoot::new_standalone(Arc::new(MemStorage::new()), Arc::new(crate::clock::SystemClock::new()));
        let mut events = root.events().subscribe();
        root.write_node("users/alice", serde_json::json!({"name": "Alice"})).await.unwrap();
        match events.recv().await.unwrap() {
            Event::Put { node_id, .. } => assert_eq!(node_id, "users/alice"),
            other => panic!("expected Put, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_node_flattens_nested_objects_into_linked_nodes() {
        let root = GunRoot::new_standalone(Arc::new(MemStorage::new()), Arc::new(crate::clock::SystemClock::new()));
        root.write_node(
            "users/alice",
            serde_json::json!({"name": "Alice", "profile": {"bio": "hi"}}),
        )
        .await
        .unwrap();

        let alice = root.storage.get("users/alice").await.unwrap().unwrap();
        assert_eq!(alice["profile"]["#"], "users/alice/profile");
        let profile = root.storage.get("users/alice/profile").await.unwrap().unwrap();
        assert_eq!(profile["bio"], "hi");
    }

    struct NeverReplies;

    #[async_trait]
    impl NetworkDispatch for NeverReplies {
        async fn dispatch_get(&self, _wire: Json, _timeout: Duration) -> Result<Option<Json>, GunError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_queries() {
        let root = GunRoot::new_standalone(Arc::new(MemStorage::new()), Arc::new(crate::clock::SystemClock::new()));
        let engine = root.query_engine();

        let engine2 = engine.clone();
        let handle = tokio::spawn(async move {
            engine2
                .once(
                    Some(&NeverReplies),
                    "users/alice",
                    &[],
                    &crate::query::QueryTransforms::default(),
                    Duration::from_secs(60),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.pending_count(), 1);

        root.shutdown().await;

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("query should resolve promptly once shutdown cancels it")
            .unwrap();
        assert!(result.is_err());
        assert_eq!(engine.pending_count(), 0);
    }
}
