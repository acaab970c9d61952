//! WebSocket `Transport` (§4.5 variant i, the default). Connects outbound
//! to a relay/peer's `ws://`/`wss://` endpoint (§6); `http(s)://` is
//! upgraded to the matching WS scheme.
//!
//! Follows the teacher's `web.rs` pattern of shuttling frames between the
//! socket and the rest of the system via a dedicated reader/writer task
//! pair connected through channels, rather than sharing the socket handle
//! directly (`bridge_ws` in `web.rs`).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{is_keepalive, ping_frame, pong_frame, ConnectionState, Transport, TransportConfig};
use crate::error::GunError;

/// Upgrades `http(s)://` to `ws(s)://`; leaves an explicit `ws(s)://`
/// untouched (§6 "Scheme is inferred from input").
pub fn normalize_url(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = input.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        input.to_string()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct WebSocketTransport {
    url: String,
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    in_rx: Mutex<Option<mpsc::Receiver<Json>>>,
    out_tx: mpsc::Sender<Json>,
    out_rx: Mutex<Option<mpsc::Receiver<Json>>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, config: TransportConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (in_tx_placeholder, in_rx) = mpsc::channel(256);
        // in_tx is recreated per-connect (see connect()); stash a throwaway
        // sender here only so the struct fields have a definite type.
        drop(in_tx_placeholder);
        let (out_tx, out_rx) = mpsc::channel(256);
        Arc::new(Self {
            url: normalize_url(&url.into()),
            config,
            state_tx,
            state_rx,
            in_rx: Mutex::new(Some(in_rx)),
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<(), GunError> {
        let _ = self.state_tx.send(ConnectionState::Connecting);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| GunError::network(format!("websocket connect failed: {e}")))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let in_tx = {
            // Re-wire the incoming channel: a fresh connect() gets a fresh pair.
            let (tx, rx) = mpsc::channel(256);
            *self.in_rx.lock() = Some(rx);
            tx
        };
        let mut out_rx = self
            .out_rx
            .lock()
            .take()
            .unwrap_or_else(|| mpsc::channel(256).1);

        let state_tx = self.state_tx.clone();
        let ping_interval = self.config.ping_interval;

        // Reader task: socket -> in_tx, filtering/answering keep-alives.
        let reader_out_tx = self.out_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(_) => break,
                };
                let text = match frame {
                    WsMessage::Text(t) => t.to_string(),
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let Ok(parsed) = serde_json::from_str::<Json>(&text) else {
                    continue;
                };
                if is_keepalive(&parsed) {
                    if let Some(ts) = parsed.get("ping").and_then(Json::as_u64) {
                        let id = parsed.get("@").and_then(Json::as_str).unwrap_or("");
                        let _ = reader_out_tx.send(pong_frame(ts, id)).await;
                    }
                    continue;
                }
                if in_tx.send(parsed).await.is_err() {
                    break;
                }
            }
            let _ = state_tx.send(ConnectionState::Disconnected);
        });

        // Writer task: out_rx -> socket, plus periodic pings.
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let frame = ping_frame(now_ms());
                        if ws_write.send(WsMessage::text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                    msg = out_rx.recv() => {
                        match msg {
                            Some(m) => {
                                if ws_write.send(WsMessage::text(m.to_string())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

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
            .map_err(|_| GunError::network("websocket writer task is gone"))
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

    #[test]
    fn http_scheme_is_upgraded_to_ws() {
        assert_eq!(normalize_url("http://relay.example/gun"), "ws://relay.example/gun");
        assert_eq!(normalize_url("https://relay.example/gun"), "wss://relay.example/gun");
        assert_eq!(normalize_url("ws://relay.example/gun"), "ws://relay.example/gun");
        assert_eq!(normalize_url("wss://relay.example/gun"), "wss://relay.example/gun");
    }
}
