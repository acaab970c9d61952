//! C6 — Handshake Manager (§4.6).
//!
//! Negotiates `hi`/`bye`, validates peer identity, and drives the peer
//! state machine `Connecting -> Authenticating -> Connected -> Disconnected
//! | Failed` (`Failed` terminal for that Transport instance).

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};

use crate::codec::Message;
use crate::error::GunError;
use crate::transport::Transport;

pub const GUN_VERSION: &str = "0.2020.1234";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Authenticating,
    Connected,
    Disconnected,
    Failed,
}

/// The negotiated identity of the far end of a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub gun_version: String,
}

pub struct HandshakeManager {
    our_pid: String,
    gun_version: String,
    state_tx: watch::Sender<PeerState>,
    state_rx: watch::Receiver<PeerState>,
    pending_initiate: Mutex<Option<oneshot::Sender<Result<PeerIdentity, GunError>>>>,
    peer_identity: Mutex<Option<PeerIdentity>>,
}

impl HandshakeManager {
    pub fn new(our_pid: impl Into<String>) -> Self {
        let (state_tx, state_rx) = watch::channel(PeerState::Connecting);
        Self {
            our_pid: our_pid.into(),
            gun_version: GUN_VERSION.to_string(),
            state_tx,
            state_rx,
            pending_initiate: Mutex::new(None),
            peer_identity: Mutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<PeerState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> PeerState {
        *self.state_rx.borrow()
    }

    pub fn peer_identity(&self) -> Option<PeerIdentity> {
        self.peer_identity.lock().clone()
    }

    fn set_state(&self, state: PeerState) {
        let _ = self.state_tx.send(state);
    }

    /// Initiator role: send `hi{gun,pid}` and wait (up to 5s, §4.6) for the
    /// receiver's reply `hi` carrying `#` = our message's `@`.
    pub async fn initiate(&self, transport: &dyn Transport) -> Result<PeerIdentity, GunError> {
        self.set_state(PeerState::Authenticating);
        let msg_id = crate::id::random_id(8);
        let (tx, rx) = oneshot::channel();
        *self.pending_initiate.lock() = Some(tx);

        let hi = Message::hi(self.gun_version.clone(), self.our_pid.clone(), msg_id);
        transport.send(hi.to_wire()).await?;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, rx).await {
            Ok(Ok(Ok(identity))) => {
                self.set_state(PeerState::Connected);
                *self.peer_identity.lock() = Some(identity.clone());
                Ok(identity)
            }
            Ok(Ok(Err(e))) => {
                self.set_state(PeerState::Failed);
                Err(e)
            }
            Ok(Err(_)) | Err(_) => {
                self.set_state(PeerState::Failed);
                Err(GunError::timeout("handshake", HANDSHAKE_TIMEOUT.as_millis() as u64))
            }
        }
    }

    /// Demultiplexed by [`crate::peer::Peer`] for every `hi`/`bye` frame.
    /// Handles both the receiver role (replying to an inbound `hi`) and
    /// completing our own `initiate` when the reply arrives.
    pub async fn handle_message(&self, msg: &Message, transport: &dyn Transport) -> Result<(), GunError> {
        match msg {
            Message::Hi { gun_version, peer_id, msg_id, reply_to } => {
                if peer_id.is_empty() || gun_version.is_empty() {
                    let err = GunError::new(
                        crate::error::ErrorKind::Validation,
                        "hi must carry non-empty gun and pid fields",
                    );
                    let dam = Message::dam(&err, crate::id::random_id(8), Some(msg_id));
                    transport.send(dam.to_wire()).await?;
                    return Err(err);
                }
                let identity = PeerIdentity {
                    peer_id: peer_id.clone(),
                    gun_version: gun_version.clone(),
                };
                match reply_to {
                    None => {
                        // Receiver role: register peer, reply with our own hi.
                        *self.peer_identity.lock() = Some(identity);
                        self.set_state(PeerState::Connected);
                        let reply = Message::Hi {
                            gun_version: self.gun_version.clone(),
                            peer_id: self.our_pid.clone(),
                            msg_id: crate::id::random_id(8),
                            reply_to: Some(msg_id.clone()),
                        };
                        transport.send(reply.to_wire()).await?;
                    }
                    Some(_) => {
                        // Initiator role: this completes our own `initiate`.
                        if let Some(tx) = self.pending_initiate.lock().take() {
                            let _ = tx.send(Ok(identity));
                        }
                    }
                }
                Ok(())
            }
            Message::Bye { .. } => {
                self.set_state(PeerState::Disconnected);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// On local shutdown: `bye` sent to every Connected peer (§4.6).
    pub async fn say_bye(&self, transport: &dyn Transport) -> Result<(), GunError> {
        if self.current_state() == PeerState::Connected {
            let bye = Message::bye(Some(self.our_pid.clone()), crate::id::random_id(8));
            transport.send(bye.to_wire()).await?;
        }
        self.set_state(PeerState::Disconnected);
        Ok(())
    }
}
