//! C8 — Mesh Discovery (§4.8).
//!
//! Maintains a target connection count across a known-peers set,
//! reconnecting on a timer rather than eagerly, with a small jittered
//! delay between dial attempts to avoid a thundering herd.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;

use crate::error::GunError;

pub const DEFAULT_TARGET: usize = 8;
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum MeshEvent {
    Discovered { url: String },
    Connected { url: String },
    Disconnected { url: String },
    Failed { url: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub target: usize,
    pub tick_interval: Duration,
    pub reconnect_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            target: DEFAULT_TARGET,
            tick_interval: DEFAULT_TICK_INTERVAL,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

/// Dials a known peer url; implemented by whatever owns the actual
/// Transport/Peer construction (kept out of this module so Mesh
/// Discovery stays ignorant of transport wiring, cf. §9 design note).
#[async_trait]
pub trait PeerDialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<(), GunError>;
}

struct KnownPeer {
    connected: bool,
    last_attempt: Option<Instant>,
}

/// Owns the known-peers set and the periodic reconnect tick.
pub struct MeshDiscovery {
    dialer: Arc<dyn PeerDialer>,
    config: MeshConfig,
    known: Mutex<HashMap<String, KnownPeer>>,
    connected_count: AtomicUsize,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshDiscovery {
    pub fn new(dialer: Arc<dyn PeerDialer>, config: MeshConfig) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(64);
        Arc::new(Self {
            dialer,
            config,
            known: Mutex::new(HashMap::new()),
            connected_count: AtomicUsize::new(0),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn add_known_peer(&self, url: impl Into<String>) {
        let url = url.into();
        let mut known = self.known.lock();
        if !known.contains_key(&url) {
            known.insert(
                url.clone(),
                KnownPeer {
                    connected: false,
                    last_attempt: None,
                },
            );
            let _ = self.events.send(MeshEvent::Discovered { url });
        }
    }

    pub fn mark_connected(&self, url: &str) {
        if let Some(peer) = self.known.lock().get_mut(url) {
            if !peer.connected {
                peer.connected = true;
                self.connected_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        let _ = self.events.send(MeshEvent::Connected { url: url.to_string() });
    }

    pub fn mark_disconnected(&self, url: &str) {
        if let Some(peer) = self.known.lock().get_mut(url) {
            if peer.connected {
                peer.connected = false;
                self.connected_count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _ = self.events.send(MeshEvent::Disconnected { url: url.to_string() });
    }

    pub fn connected_count(&self) -> usize {
        self.connected_count.load(Ordering::SeqCst)
    }

    /// One reconnect pass: pick unconnected peers not attempted within the
    /// reconnect interval, up to the connection shortfall, dialing each
    /// after a small jittered delay (§4.8).
    pub async fn tick(self: &Arc<Self>) {
        let shortfall = self.config.target.saturating_sub(self.connected_count());
        if shortfall == 0 {
            return;
        }

        let now = Instant::now();
        let candidates: Vec<String> = {
            let mut known = self.known.lock();
            let mut candidates: Vec<String> = known
                .iter()
                .filter(|(_, p)| {
                    !p.connected
                        && p.last_attempt
                            .map(|t| now.duration_since(t) >= self.config.reconnect_interval)
                            .unwrap_or(true)
                })
                .map(|(url, _)| url.clone())
                .collect();
            {
                let mut rng = rand::thread_rng();
                // Fisher-Yates shuffle so "a random unconnected peer" holds
                // even when the shortfall is smaller than the candidate set.
                for i in (1..candidates.len()).rev() {
                    let j = rng.gen_range(0..=i);
                    candidates.swap(i, j);
                }
            }
            candidates.truncate(shortfall);
            for url in &candidates {
                if let Some(p) = known.get_mut(url) {
                    p.last_attempt = Some(now);
                }
            }
            candidates
        };

        for url in candidates {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(100..=300));
            tokio::time::sleep(jitter).await;
            match self.dialer.dial(&url).await {
                Ok(()) => self.mark_connected(&url),
                Err(err) => {
                    let _ = self.events.send(MeshEvent::Failed {
                        url,
                        reason: err.message,
                    });
                }
            }
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.tick_interval);
            loop {
                ticker.tick().await;
                this.tick().await;
            }
        });
    }
}
