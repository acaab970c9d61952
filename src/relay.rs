//! C9 — Relay Pool (§4.9).
//!
//! A pool of `RelayClient`s, each a Peer-like entity over websocket,
//! load-balanced by a configurable strategy with periodic health
//! checks and per-relay exponential backoff.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value as Json;

use crate::codec::Message;
use crate::error::GunError;
use crate::peer::Peer;

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const UNHEALTHY_AFTER_FAILURES: u32 = 3;
const EVICT_AFTER_FAILURES: u32 = 5;
const EVICT_AFTER_UNHEALTHY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStrategy {
    RoundRobin,
    LeastConnections,
    Random,
    HealthBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl RelayStatus {
    fn score_component(self) -> f64 {
        match self {
            RelayStatus::Healthy => 1.0,
            RelayStatus::Degraded => 0.5,
            RelayStatus::Unhealthy => 0.1,
            RelayStatus::Unknown => 0.3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayPoolConfig {
    pub seeds: Vec<String>,
    pub min: usize,
    pub max: usize,
    pub strategy: RelayStrategy,
    pub health_check_interval: Duration,
    pub auto_discovery: bool,
    pub max_reconnect_attempts: u32,
}

impl Default for RelayPoolConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            min: 1,
            max: 4,
            strategy: RelayStrategy::HealthBased,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            auto_discovery: false,
            max_reconnect_attempts: 10,
        }
    }
}

/// One entry in the pool: a peer connection plus health/load bookkeeping.
pub struct RelayClient {
    pub url: String,
    peer: Mutex<Option<Arc<Peer>>>,
    status: Mutex<RelayStatus>,
    connections: AtomicU64,
    rtt_ms: AtomicU64,
    consecutive_failures: AtomicU32,
    unhealthy_since: Mutex<Option<Instant>>,
    reconnect_attempts: AtomicU32,
}

impl RelayClient {
    fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            peer: Mutex::new(None),
            status: Mutex::new(RelayStatus::Unknown),
            connections: AtomicU64::new(0),
            rtt_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            unhealthy_since: Mutex::new(None),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn status(&self) -> RelayStatus {
        *self.status.lock()
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.load(Ordering::SeqCst)
    }

    fn score(&self) -> f64 {
        self.status().score_component()
            - (self.connections() as f64 / 100.0)
            - (self.rtt_ms() as f64 / 1000.0)
    }

    fn is_connected(&self) -> bool {
        self.peer.lock().is_some()
    }

    /// §4.9: `1s * 2^min(attempts-1,5) + rand(0..1000)ms`.
    pub fn backoff_delay(&self) -> Duration {
        let attempts = self.reconnect_attempts.load(Ordering::SeqCst).max(1);
        let exp = attempts.saturating_sub(1).min(5);
        let base = 1000u64 * (1u64 << exp);
        let jitter = rand::thread_rng().gen_range(0..1000);
        Duration::from_millis(base + jitter)
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut unhealthy_since = self.unhealthy_since.lock();
        if self.status() != RelayStatus::Healthy {
            *self.status.lock() = RelayStatus::Healthy;
        }
        *unhealthy_since = None;
    }

    fn record_failure(&self) -> u32 {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures > UNHEALTHY_AFTER_FAILURES {
            let mut status = self.status.lock();
            if *status != RelayStatus::Unhealthy {
                *status = RelayStatus::Unhealthy;
                *self.unhealthy_since.lock() = Some(Instant::now());
            }
        } else if failures > 1 {
            *self.status.lock() = RelayStatus::Degraded;
        }
        failures
    }

    fn should_evict(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures < EVICT_AFTER_FAILURES {
            return false;
        }
        self.unhealthy_since
            .lock()
            .map(|since| since.elapsed() >= EVICT_AFTER_UNHEALTHY)
            .unwrap_or(false)
    }
}

/// Factory for the `Peer` backing a `RelayClient`, decoupling the pool
/// from concrete transport construction (cf. [`crate::mesh::PeerDialer`]).
#[async_trait::async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<Peer>, GunError>;
}

pub struct RelayPool {
    config: RelayPoolConfig,
    connector: Arc<dyn RelayConnector>,
    relays: Mutex<Vec<Arc<RelayClient>>>,
    round_robin_cursor: AtomicU64,
}

impl RelayPool {
    pub fn new(config: RelayPoolConfig, connector: Arc<dyn RelayConnector>) -> Arc<Self> {
        let relays = config.seeds.iter().map(|s| RelayClient::new(s.clone())).collect();
        Arc::new(Self {
            config,
            connector,
            relays: Mutex::new(relays),
            round_robin_cursor: AtomicU64::new(0),
        })
    }

    pub fn relay_count(&self) -> usize {
        self.relays.lock().len()
    }

    pub fn add_relay(&self, url: impl Into<String>) {
        let mut relays = self.relays.lock();
        if relays.len() < self.config.max {
            relays.push(RelayClient::new(url));
        }
    }

    /// Health check pass (§4.9): reconnect the disconnected, ping the
    /// connected and measure rtt, evict what's been unhealthy too long.
    pub async fn health_check(self: &Arc<Self>) {
        let snapshot: Vec<Arc<RelayClient>> = self.relays.lock().clone();
        for relay in &snapshot {
            if relay.is_connected() {
                let start = Instant::now();
                let peer = relay.peer.lock().clone();
                if let Some(peer) = peer {
                    // A dedicated, tracker-correlated application message
                    // (§4.9): the remote's own Peer replies with `Pong`,
                    // unlike the transport-level keep-alive ping/pong that
                    // never reaches this layer (§4.5/§6).
                    let ping = Message::ping(crate::id::random_id(8)).to_wire();
                    match peer.send_tracked(ping, Duration::from_secs(5)).await {
                        Ok(_) => {
                            relay.rtt_ms.store(start.elapsed().as_millis() as u64, Ordering::SeqCst);
                            relay.record_success();
                        }
                        Err(_) => {
                            relay.record_failure();
                        }
                    }
                }
            } else {
                relay.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                if relay.reconnect_attempts.load(Ordering::SeqCst) <= self.config.max_reconnect_attempts {
                    match self.connector.connect(&relay.url).await {
                        Ok(peer) => {
                            *relay.peer.lock() = Some(peer);
                            relay.reconnect_attempts.store(0, Ordering::SeqCst);
                            relay.record_success();
                        }
                        Err(_) => {
                            relay.record_failure();
                        }
                    }
                }
            }
        }
        self.relays.lock().retain(|r| !r.should_evict());
    }

    pub fn spawn_health_checks(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.health_check_interval);
            loop {
                ticker.tick().await;
                this.health_check().await;
            }
        });
    }

    fn pick(&self) -> Option<Arc<RelayClient>> {
        let relays = self.relays.lock();
        let candidates: Vec<&Arc<RelayClient>> =
            relays.iter().filter(|r| r.status() != RelayStatus::Unhealthy).collect();
        let pool: Vec<&Arc<RelayClient>> = if candidates.is_empty() {
            relays.iter().collect()
        } else {
            candidates
        };
        if pool.is_empty() {
            return None;
        }
        match self.config.strategy {
            RelayStrategy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::SeqCst) as usize % pool.len();
                Some(pool[idx].clone())
            }
            RelayStrategy::LeastConnections => pool
                .into_iter()
                .min_by_key(|r| r.connections())
                .cloned(),
            RelayStrategy::Random => {
                let idx = rand::thread_rng().gen_range(0..pool.len());
                Some(pool[idx].clone())
            }
            RelayStrategy::HealthBased => pool
                .into_iter()
                .max_by(|a, b| a.score().partial_cmp(&b.score()).unwrap_or(std::cmp::Ordering::Equal))
                .cloned(),
        }
    }

    /// §4.9 `send`: picks a relay per strategy; on failure, records it and
    /// retries once with the next-best relay; further failure propagates
    /// as `Network`.
    pub async fn send(self: &Arc<Self>, wire: Json, timeout: Duration) -> Result<Json, GunError> {
        let first = self.pick().ok_or_else(|| GunError::network("relay pool is empty"))?;
        match self.send_via(&first, wire.clone(), timeout).await {
            Ok(v) => Ok(v),
            Err(_) => {
                first.record_failure();
                let second = self.pick().filter(|r| !Arc::ptr_eq(r, &first));
                match second {
                    Some(relay) => self.send_via(&relay, wire, timeout).await.map_err(|e| {
                        relay.record_failure();
                        GunError::network(format!("relay send failed on retry: {e}"))
                    }),
                    None => Err(GunError::network("relay send failed and no alternate relay available")),
                }
            }
        }
    }

    async fn send_via(&self, relay: &Arc<RelayClient>, wire: Json, timeout: Duration) -> Result<Json, GunError> {
        let peer = relay.peer.lock().clone().ok_or_else(|| GunError::network("relay not connected"))?;
        relay.connections.fetch_add(1, Ordering::SeqCst);
        let result = peer.send_tracked(wire, timeout).await;
        relay.connections.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            relay.record_success();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_based_score_prefers_healthy_low_load() {
        let healthy = RelayClient::new("a");
        *healthy.status.lock() = RelayStatus::Healthy;
        let degraded = RelayClient::new("b");
        *degraded.status.lock() = RelayStatus::Degraded;
        assert!(healthy.score() > degraded.score());
    }

    #[test]
    fn backoff_doubles_and_caps_exponent_at_five() {
        let relay = RelayClient::new("a");
        relay.reconnect_attempts.store(1, Ordering::SeqCst);
        let d1 = relay.backoff_delay();
        assert!(d1.as_millis() >= 1000 && d1.as_millis() < 2000);

        relay.reconnect_attempts.store(7, Ordering::SeqCst);
        let d7 = relay.backoff_delay();
        // exponent capped at 5 -> base 32000ms plus up to 1000ms jitter
        assert!(d7.as_millis() >= 32_000 && d7.as_millis() < 33_000);
    }

    #[test]
    fn becomes_unhealthy_after_more_than_three_failures() {
        let relay = RelayClient::new("a");
        for _ in 0..4 {
            relay.record_failure();
        }
        assert_eq!(relay.status(), RelayStatus::Unhealthy);
    }

    #[test]
    fn eviction_requires_both_failure_count_and_unhealthy_duration() {
        let relay = RelayClient::new("a");
        for _ in 0..5 {
            relay.record_failure();
        }
        // Unhealthy but not long enough yet.
        assert!(!relay.should_evict());
    }

    struct NeverConnects;
    #[async_trait::async_trait]
    impl RelayConnector for NeverConnects {
        async fn connect(&self, _url: &str) -> Result<Arc<Peer>, GunError> {
            Err(GunError::network("refused"))
        }
    }

    #[tokio::test]
    async fn send_with_empty_pool_is_network_error() {
        let pool = RelayPool::new(RelayPoolConfig::default(), Arc::new(NeverConnects));
        let err = pool.send(serde_json::json!({}), Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Network);
    }

    #[tokio::test]
    async fn health_check_pings_a_connected_relay_and_records_rtt() {
        use crate::clock::SystemClock;
        use crate::error::ErrorHandler;
        use crate::metadata::KeyedLocks;
        use crate::testing::MemStorage;
        use crate::transport::memory::InMemoryTransport;

        let (ours, theirs) = InMemoryTransport::pair();
        let make_peer = |t: InMemoryTransport, pid: &str| {
            let (tx, _rx) = crate::event::channel();
            Peer::new(
                Arc::new(t),
                pid,
                Arc::new(MemStorage::new()),
                Arc::new(SystemClock::new()),
                tx,
                Arc::new(ErrorHandler::new()),
                Arc::new(KeyedLocks::new()),
            )
        };
        let our_peer = make_peer(ours, "us");
        let relay_peer = make_peer(theirs, "relay-server");
        relay_peer.transport.connect().await.unwrap();
        relay_peer.spawn_dispatch_loop();
        our_peer.connect().await.unwrap();

        let relay = RelayClient::new("ws://relay.test");
        *relay.peer.lock() = Some(our_peer);
        *relay.status.lock() = RelayStatus::Unknown;

        let pool = RelayPool::new(RelayPoolConfig::default(), Arc::new(NeverConnects));
        *pool.relays.lock() = vec![relay.clone()];

        pool.health_check().await;

        assert_eq!(relay.status(), RelayStatus::Healthy);
        assert_eq!(pool.relay_count(), 1);
    }
}
