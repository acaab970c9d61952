//! C4 — Message Tracker (§4.4).
//!
//! Assigns `@` ids, correlates `ok`/`dam` replies back to the awaiter that
//! sent the original message, enforces a per-message timeout, and bounds a
//! dedup history of seen ids. Used both by [`crate::peer::Peer`] and by
//! each relay client (§4.9).

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::oneshot;

use crate::error::GunError;

type TrackerResult = Result<Json, GunError>;

struct PendingEntry {
    tx: Option<oneshot::Sender<TrackerResult>>,
}

struct History {
    order: VecDeque<String>,
    seen: HashSet<String>,
    max: usize,
}

impl History {
    fn new(max: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(max.min(4096)),
            seen: HashSet::new(),
            max,
        }
    }

    fn record(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        if self.order.len() >= self.max {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        false
    }
}

/// An outstanding reply, produced by [`Tracker::send`]. Resolves to the
/// `ok` payload, a decoded [`GunError`] from `dam`, a `Timeout`, or
/// `Cancelled` — exactly one of those four per §8's testable property.
pub struct Awaiter {
    rx: oneshot::Receiver<TrackerResult>,
    msg_id: String,
}

impl Awaiter {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub async fn wait(self) -> TrackerResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(GunError::cancelled("tracker-awaiter")),
        }
    }
}

/// `pending[msgId] -> (message, awaiter, sent_at, timeout)` plus a bounded
/// seen-id history for rebroadcast dedup (§4.4).
pub struct Tracker {
    pending: Mutex<HashMap<String, PendingEntry>>,
    history: Mutex<History>,
}

impl Tracker {
    pub fn new(max_history: usize) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(History::new(max_history)),
        })
    }

    /// Assigns `@` on `wire` if absent, records it as pending, invokes
    /// `sender` (the I/O), and arms a timeout that fails the awaiter if no
    /// ack/error arrives in time (§4.4).
    pub async fn send<F, Fut>(
        self: &Arc<Self>,
        mut wire: Json,
        timeout: Duration,
        sender: F,
    ) -> Result<Awaiter, GunError>
    where
        F: FnOnce(Json) -> Fut,
        Fut: Future<Output = Result<(), GunError>>,
    {
        let msg_id = match wire.get("@").and_then(Json::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = crate::id::random_id(8);
                if let Json::Object(map) = &mut wire {
                    map.insert("@".into(), Json::String(id.clone()));
                }
                id
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id.clone(), PendingEntry { tx: Some(tx) });

        let timeout_tracker = self.clone();
        let timeout_id = msg_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            timeout_tracker.handle_timeout(&timeout_id, timeout);
        });

        if let Err(err) = sender(wire).await {
            self.fail(&msg_id, err.clone());
            return Err(err);
        }

        Ok(Awaiter { rx, msg_id })
    }

    /// `handleAck(id, ackedBy)`: fulfills the awaiter, removes from pending.
    pub fn handle_ack(&self, id: &str, acked_by: Json) {
        if let Some(mut entry) = self.pending.lock().remove(id) {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Ok(acked_by));
            }
        }
    }

    /// `handleError(id, reason)`: fails the awaiter with a decoded kind.
    pub fn handle_error(&self, id: &str, reason: GunError) {
        self.fail(id, reason);
    }

    fn fail(&self, id: &str, reason: GunError) {
        if let Some(mut entry) = self.pending.lock().remove(id) {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(reason));
            }
        }
    }

    fn handle_timeout(&self, id: &str, timeout: Duration) {
        if self.pending.lock().contains_key(id) {
            self.fail(id, GunError::timeout(id, timeout.as_millis() as u64));
        }
    }

    /// `hasSeen(id) -> bool`: dedup of rebroadcasts (§4.4). Records `id`
    /// into the bounded history as a side effect, so the first call for a
    /// given id returns `false` and every later one returns `true`.
    pub fn has_seen(&self, id: &str) -> bool {
        self.history.lock().record(id)
    }

    /// Disposal: fails every outstanding awaiter with `Cancelled` (§4.4).
    pub fn cancel_all(&self) {
        let mut pending = self.pending.lock();
        for (id, mut entry) in pending.drain() {
            if let Some(tx) = entry.tx.take() {
                let _ = tx.send(Err(GunError::cancelled(&id)));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ack_resolves_awaiter_and_clears_pending() {
        let tracker = Tracker::new(1000);
        let awaiter = tracker
            .send(serde_json::json!({"get": {"#": "x"}}), Duration::from_secs(5), |_| async {
                Ok(())
            })
            .await
            .unwrap();
        let id = awaiter.msg_id().to_string();
        tracker.handle_ack(&id, serde_json::json!(true));
        let result = awaiter.wait().await.unwrap();
        assert_eq!(result, serde_json::json!(true));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_fails_awaiter_with_decoded_kind() {
        let tracker = Tracker::new(1000);
        let awaiter = tracker
            .send(serde_json::json!({"get": {"#": "x"}}), Duration::from_secs(5), |_| async {
                Ok(())
            })
            .await
            .unwrap();
        let id = awaiter.msg_id().to_string();
        tracker.handle_error(&id, GunError::not_found("x"));
        let err = awaiter.wait().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn timeout_fails_awaiter_when_unanswered() {
        let tracker = Tracker::new(1000);
        let awaiter = tracker
            .send(serde_json::json!({"get": {"#": "x"}}), Duration::from_millis(20), |_| async {
                Ok(())
            })
            .await
            .unwrap();
        let err = awaiter.wait().await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn cancel_all_fails_outstanding_awaiters() {
        let tracker = Tracker::new(1000);
        let awaiter = tracker
            .send(serde_json::json!({"get": {"#": "x"}}), Duration::from_secs(5), |_| async {
                Ok(())
            })
            .await
            .unwrap();
        tracker.cancel_all();
        let err = awaiter.wait().await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("cancelled"));
    }

    #[test]
    fn has_seen_dedups_repeated_ids() {
        let tracker = Tracker::new(1000);
        assert!(!tracker.has_seen("msg-1"));
        assert!(tracker.has_seen("msg-1"));
    }

    #[test]
    fn has_seen_respects_bounded_history() {
        let tracker = Tracker::new(2);
        assert!(!tracker.has_seen("a"));
        assert!(!tracker.has_seen("b"));
        assert!(!tracker.has_seen("c")); // evicts "a"
        assert!(!tracker.has_seen("a")); // "a" was evicted, so not seen again
    }
}
