//! C7 — Peer (§4.7).
//!
//! Binds one [`Transport`] to a [`HandshakeManager`], a [`Tracker`], and
//! Storage; demultiplexes every incoming frame by message kind. Mirrors
//! the teacher's `s2s.rs` link-handler dispatch loop, generalized from
//! IRC-link framing to the wire protocol's `get/put/hi/bye/dam/ok` kinds.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;
use tokio::sync::{broadcast, watch};

use crate::clock::ProcessClock;
use crate::codec::{self, Message};
use crate::error::{ErrorHandler, GunError};
use crate::event::Event;
use crate::handshake::{HandshakeManager, PeerIdentity, PeerState};
use crate::metadata::{KeyedLocks, MetadataManager};
use crate::node::Node;
use crate::storage::Storage;
use crate::tracker::Tracker;
use crate::transport::Transport;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One live connection to another replica. Owns the demux loop; never
/// blocks waiting on Storage for more than a single `put`/`get` (a slow
/// store degrades that one request, not the whole connection).
pub struct Peer {
    pub transport: Arc<dyn Transport>,
    pub handshake: Arc<HandshakeManager>,
    pub tracker: Arc<Tracker>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn ProcessClock>,
    events: broadcast::Sender<Event>,
    errors: Arc<ErrorHandler>,
    key_locks: Arc<KeyedLocks>,
}

impl Peer {
    pub fn new(
        transport: Arc<dyn Transport>,
        our_pid: impl Into<String>,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn ProcessClock>,
        events: broadcast::Sender<Event>,
        errors: Arc<ErrorHandler>,
        key_locks: Arc<KeyedLocks>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            handshake: Arc::new(HandshakeManager::new(our_pid)),
            tracker: Tracker::new(1000),
            storage,
            clock,
            events,
            errors,
            key_locks,
        })
    }

    pub fn state(&self) -> watch::Receiver<PeerState> {
        self.handshake.state()
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        self.handshake.peer_identity()
    }

    /// Connects, starts the dispatch loop, and performs the initiator-role
    /// handshake (§4.6). The dispatch loop must already be consuming
    /// `take_incoming()` before `initiate` sends its `hi`, or the reply
    /// would have nowhere to be delivered.
    pub async fn connect(self: &Arc<Self>) -> Result<PeerIdentity, GunError> {
        self.transport.connect().await?;
        self.spawn_dispatch_loop();
        let identity = self.handshake.initiate(self.transport.as_ref()).await?;
        let _ = self.events.send(Event::PeerConnected {
            peer_id: identity.peer_id.clone(),
        });
        Ok(identity)
    }

    /// Registers this already-connected transport without re-dialing —
    /// used on the receiving end of an inbound connection.
    pub fn spawn_dispatch_loop(self: &Arc<Self>) {
        let Some(mut incoming) = self.transport.take_incoming() else {
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                this.dispatch(frame).await;
            }
            let peer_id = this
                .handshake
                .peer_identity()
                .map(|i| i.peer_id)
                .unwrap_or_default();
            this.tracker.cancel_all();
            let _ = this.events.send(Event::PeerDisconnected {
                peer_id,
                reason: "transport closed".into(),
            });
        });
    }

    pub async fn disconnect(&self) -> Result<(), GunError> {
        self.handshake.say_bye(self.transport.as_ref()).await?;
        self.tracker.cancel_all();
        self.transport.disconnect().await
    }

    async fn dispatch(&self, frame: Json) {
        let frame = codec::strip_passthrough_keys(&frame);
        let Some(msg) = Message::from_wire(&frame) else {
            return;
        };

        match &msg {
            Message::Hi { .. } | Message::Bye { .. } => {
                if let Err(err) = self.handshake.handle_message(&msg, self.transport.as_ref()).await {
                    self.errors.handle(err);
                }
                if let Message::Bye { peer_id, .. } = &msg {
                    let _ = self.events.send(Event::PeerDisconnected {
                        peer_id: peer_id.clone().unwrap_or_default(),
                        reason: "bye".into(),
                    });
                }
            }
            Message::Ok { value, reply_to, .. } => {
                if let Some(rt) = reply_to {
                    self.tracker.handle_ack(rt, value.clone());
                }
            }
            Message::Dam { .. } => {
                let err = GunError::decode_dam(&frame);
                self.errors.handle_dam(err.clone());
                if let Some(rt) = msg.reply_to() {
                    self.tracker.handle_error(rt, err);
                } else {
                    let _ = self.events.send(Event::Error(err));
                }
            }
            Message::Put { .. } => {
                self.handle_put(&msg).await;
            }
            Message::Get { .. } => {
                self.handle_get(&msg).await;
            }
            Message::Ping { msg_id, .. } => {
                let pong = Message::pong(crate::id::random_id(8), msg_id.clone());
                let _ = self.transport.send(pong.to_wire()).await;
            }
            Message::Pong { reply_to, .. } => {
                if let Some(rt) = reply_to {
                    self.tracker.handle_ack(rt, Json::Bool(true));
                }
            }
        }
    }

    async fn handle_put(&self, msg: &Message) {
        let msg_id = msg.msg_id().to_string();
        let reply_to = msg.reply_to().map(str::to_string);
        let mut last_wire: Option<Json> = None;
        for (node_id, incoming) in msg.nodes() {
            // Serializes against a concurrent local `write_node` (or another
            // incoming put) to the same key (§5); different keys proceed in
            // parallel since `key_locks` locks are per-id.
            let _guard = self.key_locks.lock(&node_id).await;
            let existing = match self.storage.get(&node_id).await {
                Ok(v) => v.as_ref().and_then(|raw| Node::from_wire(&node_id, raw)),
                Err(err) => {
                    self.send_dam(&err, &msg_id).await;
                    continue;
                }
            };

            let merged = match existing {
                Some(current) => MetadataManager::merge_nodes(self.clock.as_ref(), &current, &incoming),
                None => incoming,
            };

            if let Err(violations) = merged.validate() {
                let err = GunError::new(
                    crate::error::ErrorKind::Validation,
                    format!("put for \"{node_id}\" failed validation: {violations:?}"),
                )
                .with_node(node_id.clone());
                self.send_dam(&err, &msg_id).await;
                continue;
            }

            if let Err(err) = self.storage.put(&node_id, merged.to_wire()).await {
                self.send_dam(&err, &msg_id).await;
                continue;
            }

            last_wire = Some(merged.to_wire());
            let _ = self.events.send(Event::Put {
                node_id: node_id.clone(),
                node: merged,
            });
        }

        // This put answers one of our own pending `get`s (§4.11): resolve
        // that tracker entry with the node content, distinct from the
        // unconditional `ok` ack below (which correlates the *sender's*
        // own pending put, keyed by this message's own `@`).
        if let (Some(rt), Some(wire)) = (reply_to, last_wire) {
            self.tracker.handle_ack(&rt, wire);
        }

        let ok = Message::ok(Json::Bool(true), crate::id::random_id(8), msg_id);
        let _ = self.transport.send(ok.to_wire()).await;
    }

    async fn handle_get(&self, msg: &Message) {
        let Message::Get { id, path, msg_id, .. } = msg else {
            return;
        };
        match crate::query::resolve_local(self.storage.as_ref(), id, path).await {
            Ok(Some(node)) => {
                let mut nodes = std::collections::BTreeMap::new();
                nodes.insert(node.id.clone(), node.to_wire());
                let put = Message::put(nodes, crate::id::random_id(8));
                let mut wire = put.to_wire();
                if let Json::Object(map) = &mut wire {
                    map.insert("#".into(), Json::String(msg_id.clone()));
                }
                let _ = self.transport.send(wire).await;
            }
            Ok(None) => {
                let err = GunError::not_found(id.clone());
                self.send_dam(&err, msg_id).await;
            }
            Err(err) => {
                self.send_dam(&err, msg_id).await;
            }
        }
    }

    async fn send_dam(&self, err: &GunError, reply_to: &str) {
        self.errors.handle(err.clone());
        let dam = Message::dam(err, crate::id::random_id(8), Some(reply_to));
        let _ = self.transport.send(dam.to_wire()).await;
    }

    /// Sends a wire frame and correlates the reply through the tracker
    /// (§4.4), used by the Chain/Query layers for outbound `get`/`put`.
    pub async fn send_tracked(self: &Arc<Self>, wire: Json, timeout: Duration) -> Result<Json, GunError> {
        let transport = self.transport.clone();
        let awaiter = self
            .tracker
            .send(wire, timeout, move |w| {
                let transport = transport.clone();
                async move { transport.send(w).await }
            })
            .await?;
        awaiter.wait().await
    }
}
