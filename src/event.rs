//! The event bus (§5 "Shared resources"): a broadcast channel that
//! delivers each event at least once to each live subscriber, with
//! back-pressure that drops to the slowest-allowed buffer (default 64)
//! rather than ever blocking the publisher. Mirrors the shape of the
//! teacher's SDK-to-UI [`Event`] enum (`freeq-sdk/src/event.rs`),
//! generalized from IRC notifications to graph mutations.

use tokio::sync::broadcast;

use crate::node::Node;

/// Events emitted by the [`crate::root::GunRoot`] for Chain API
/// subscribers and other observers to consume.
#[derive(Debug, Clone)]
pub enum Event {
    /// A node was written locally or merged in from a peer (§4.11 `on`).
    Put { node_id: String, node: Node },
    /// A peer finished its handshake.
    PeerConnected { peer_id: String },
    /// A peer disconnected or failed.
    PeerDisconnected { peer_id: String, reason: String },
    /// A DAM was observed that wasn't correlated to any pending request (§7).
    Error(crate::error::GunError),
}

pub const DEFAULT_BUFFER: usize = 64;

pub fn channel() -> (broadcast::Sender<Event>, broadcast::Receiver<Event>) {
    broadcast::channel(DEFAULT_BUFFER)
}
