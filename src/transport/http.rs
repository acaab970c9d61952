//! HTTP long-poll `Transport` (§4.5 variant ii): one message per POST
//! request/response, plus a background poll loop for server-pushed
//! frames that arrive outside of a direct request/response pairing.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};

use super::{is_keepalive, ConnectionState, Transport, TransportConfig};
use crate::error::GunError;

pub struct HttpPollTransport {
    url: String,
    client: reqwest::Client,
    config: TransportConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    in_tx: mpsc::Sender<Json>,
    in_rx: Mutex<Option<mpsc::Receiver<Json>>>,
}

impl HttpPollTransport {
    pub fn new(url: impl Into<String>, config: TransportConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (in_tx, in_rx) = mpsc::channel(256);
        Arc::new(Self {
            url: url.into(),
            client: reqwest::Client::new(),
            config,
            state_tx,
            state_rx,
            in_tx,
            in_rx: Mutex::new(Some(in_rx)),
        })
    }

    async fn poll_once(client: &reqwest::Client, url: &str) -> Result<Option<Json>, GunError> {
        let resp = client
            .post(url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| GunError::network(format!("http poll failed: {e}")))?;
        if resp.status().as_u16() == 204 {
            return Ok(None);
        }
        let body: Json = resp
            .json()
            .await
            .map_err(|e| GunError::network(format!("http poll body decode failed: {e}")))?;
        Ok(Some(body))
    }
}

#[async_trait]
impl Transport for HttpPollTransport {
    async fn connect(&self) -> Result<(), GunError> {
        let _ = self.state_tx.send(ConnectionState::Connected);
        let client = self.client.clone();
        let url = self.url.clone();
        let in_tx = self.in_tx.clone();
        let interval = self.config.ping_interval;
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match Self::poll_once(&client, &url).await {
                    Ok(Some(frame)) if !is_keepalive(&frame) => {
                        if in_tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {
                        let _ = state_tx.send(ConnectionState::Failed);
                    }
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), GunError> {
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&self, msg: Json) -> Result<(), GunError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&msg)
            .send()
            .await
            .map_err(|e| GunError::network(format!("http send failed: {e}")))?;
        if resp.status().as_u16() != 204 {
            if let Ok(body) = resp.json::<Json>().await {
                if !is_keepalive(&body) {
                    let _ = self.in_tx.send(body).await;
                }
            }
        }
        Ok(())
    }

    fn take_incoming(&self) -> Option<mpsc::Receiver<Json>> {
        self.in_rx.lock().take()
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}
