//! C5 — Transport (§4.5).
//!
//! A capability set — `connect`, `disconnect`, `send`, an incoming
//! message stream, and a connection-state stream — implemented by three
//! variants: [`websocket::WebSocketTransport`] (default),
//! [`http::HttpPollTransport`], and [`memory::InMemoryTransport`]
//! (in-process loopback for tests). Per §9's design note, no inheritance
//! hierarchy is needed; a small trait-object wrapper suffices (cf. the
//! teacher's capability-style split between `iroh.rs` and `web.rs`
//! transports, both driving the same higher-level connection code).

pub mod http;
pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};

use crate::error::GunError;

/// §4.6's peer state machine, reused here as the Transport-level
/// connection state stream (§4.5 item v).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
    Failed,
}

/// Keep-alive cadence and reconnect policy shared by every variant (§4.5).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ping_interval: std::time::Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval: std::time::Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Linear or exponential backoff for auto-reconnect (§4.5).
#[derive(Debug, Clone, Copy)]
pub enum ReconnectPolicy {
    Linear { step_ms: u64, max_ms: u64 },
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Exponential {
            base_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        match *self {
            ReconnectPolicy::Linear { step_ms, max_ms } => (step_ms * attempt as u64).min(max_ms),
            ReconnectPolicy::Exponential { base_ms, max_ms } => {
                (base_ms.saturating_mul(1u64 << attempt.min(20))).min(max_ms)
            }
        }
    }
}

/// A bidirectional message stream, JSON-framed (§4.5). Implementations own
/// their own keep-alive ping/pong handling and never surface those frames
/// through `take_incoming`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), GunError>;
    async fn disconnect(&self) -> Result<(), GunError>;
    async fn send(&self, msg: Json) -> Result<(), GunError>;

    /// Takes ownership of the incoming-message stream; returns `None` if
    /// already taken (each transport is consumed by exactly one Peer).
    fn take_incoming(&self) -> Option<mpsc::Receiver<Json>>;

    fn state(&self) -> watch::Receiver<ConnectionState>;
}

/// Builds a `{"ping": ts_ms, "@": id}` frame.
pub(crate) fn ping_frame(ts_ms: u64) -> Json {
    serde_json::json!({"ping": ts_ms, "@": crate::id::random_id(8)})
}

/// Builds the matching `{"pong": ts_ms, "@": id}` reply.
pub(crate) fn pong_frame(ts_ms: u64, id: &str) -> Json {
    serde_json::json!({"pong": ts_ms, "@": id})
}

pub(crate) fn is_keepalive(msg: &Json) -> bool {
    msg.get("ping").is_some() || msg.get("pong").is_some()
}
