//! In-process loopback `Transport`, used for tests (§4.5 variant iii).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};

use super::{ConnectionState, Transport};
use crate::error::GunError;

/// A `Transport` wired directly to its [`pair`] peer via in-process
/// channels — no sockets, no JSON framing (already structured), no
/// keep-alive (there's nothing to go stale).
pub struct InMemoryTransport {
    out_tx: mpsc::Sender<Json>,
    in_rx: Mutex<Option<mpsc::Receiver<Json>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl InMemoryTransport {
    /// Builds two transports connected to each other, as if one peer
    /// dialed the other directly.
    pub fn pair() -> (InMemoryTransport, InMemoryTransport) {
        let (a_tx, b_rx) = mpsc::channel(256);
        let (b_tx, a_rx) = mpsc::channel(256);
        let (a_state_tx, a_state_rx) = watch::channel(ConnectionState::Disconnected);
        let (b_state_tx, b_state_rx) = watch::channel(ConnectionState::Disconnected);
        (
            InMemoryTransport {
                out_tx: a_tx,
                in_rx: Mutex::new(Some(a_rx)),
                state_tx: a_state_tx,
                state_rx: a_state_rx,
            },
            InMemoryTransport {
                out_tx: b_tx,
                in_rx: Mutex::new(Some(b_rx)),
                state_tx: b_state_tx,
                state_rx: b_state_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn connect(&self) -> Result<(), GunError> {
        let _ = self.state_tx.send(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GunError> {
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, msg: Json) -> Result<(), GunError> {
        self.out_tx
            .send(msg)
            .await
            .map_err(|_| GunError::network("in-memory transport peer dropped"))
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Json>> {
        self.in_rx.lock().take()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn paired_transports_deliver_to_each_other() {
        let (a, b) = InMemoryTransport::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        let mut b_incoming = b.take_incoming().unwrap();
        a.send(serde_json::json!({"hi": "there"})).await.unwrap();
        let received = b_incoming.recv().await.unwrap();
        assert_eq!(received, serde_json::json!({"hi": "there"}));
    }

    #[tokio::test]
    async fn take_incoming_returns_none_on_second_call() {
        let (a, _b) = InMemoryTransport::pair();
        assert!(a.take_incoming().is_some());
        assert!(a.take_incoming().is_none());
    }
}
