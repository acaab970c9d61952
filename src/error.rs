//! Error taxonomy, DAM wire encoding, and the shared retry-policy authority.
//!
//! Mirrors the teacher's split between a closed `thiserror` enum for
//! domain errors (cf. `RatchetError`/`PolicyError`) and ring-buffered
//! observability on top of it (cf. `CrdtMetrics`).

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// The closed set of error kinds exchanged as protocol `dam` messages (§4.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    NotFound,
    Unauthorized,
    Timeout,
    Validation,
    Conflict,
    Network,
    Storage,
    Malformed,
    Permission,
    RateLimit,
    Unknown,
}

impl ErrorKind {
    /// Infer a kind from a DAM message body when no explicit `type` field
    /// was present on the wire (§4.13, §8 "boundary behavior").
    fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        if m.contains("not found") {
            ErrorKind::NotFound
        } else if m.contains("timed out") || m.contains("timeout") {
            ErrorKind::Timeout
        } else if m.contains("unauthorized") || m.contains("401") {
            ErrorKind::Unauthorized
        } else if m.contains("forbidden") || m.contains("403") || m.contains("permission") {
            ErrorKind::Permission
        } else if m.contains("conflict") {
            ErrorKind::Conflict
        } else if m.contains("rate limit") || m.contains("429") {
            ErrorKind::RateLimit
        } else if m.contains("invalid") || m.contains("validation") || m.contains("malformed") {
            if m.contains("malformed") {
                ErrorKind::Malformed
            } else {
                ErrorKind::Validation
            }
        } else if m.contains("network") || m.contains("connection") {
            ErrorKind::Network
        } else if m.contains("storage") || m.contains("disk") {
            ErrorKind::Storage
        } else {
            ErrorKind::Unknown
        }
    }

    /// §4.13 retry policy: only `Timeout` and `Network` are retryable.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::Network)
    }
}

/// The single error type returned by every fallible public operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct GunError {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<String>,
    pub node_id: Option<String>,
    pub field: Option<String>,
    pub context: HashMap<String, Json>,
    pub timestamp: u64,
    pub error_id: String,
}

impl GunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            node_id: None,
            field: None,
            context: HashMap::new(),
            timestamp: now_ms(),
            error_id: gen_error_id(),
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Json) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn not_found(node_id: impl Into<String>) -> Self {
        let id = node_id.into();
        Self::new(ErrorKind::NotFound, format!("Node \"{id}\" not found")).with_node(id)
    }

    pub fn timeout(operation: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Operation \"{operation}\" timed out after {timeout_ms}ms"),
        )
        .with_context("timeoutMs", Json::from(timeout_ms))
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(ErrorKind::Unknown, format!("Operation \"{operation}\" cancelled"))
            .with_code("cancelled")
    }

    /// §4.13 DAM encode: `{dam, @, #, node?, field?, code?, type, context?}`.
    pub fn encode_dam(&self, in_reply_to: Option<&str>) -> Json {
        let mut obj = serde_json::Map::new();
        obj.insert("dam".into(), Json::String(self.message.clone()));
        obj.insert("@".into(), Json::String(self.error_id.clone()));
        if let Some(r) = in_reply_to {
            obj.insert("#".into(), Json::String(r.to_string()));
        }
        if let Some(node) = &self.node_id {
            obj.insert("node".into(), Json::String(node.clone()));
        }
        if let Some(field) = &self.field {
            obj.insert("field".into(), Json::String(field.clone()));
        }
        if let Some(code) = &self.code {
            obj.insert("code".into(), Json::String(code.clone()));
        }
        obj.insert(
            "type".into(),
            serde_json::to_value(self.kind).unwrap_or(Json::String("unknown".into())),
        );
        if !self.context.is_empty() {
            obj.insert(
                "context".into(),
                Json::Object(self.context.clone().into_iter().collect()),
            );
        }
        Json::Object(obj)
    }

    /// §4.13 DAM decode: `type` wins if present, else classify by keyword.
    pub fn decode_dam(msg: &Json) -> Self {
        let message = msg
            .get("dam")
            .and_then(Json::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let kind = msg
            .get("type")
            .and_then(Json::as_str)
            .and_then(|t| serde_json::from_value(Json::String(t.to_string())).ok())
            .unwrap_or_else(|| ErrorKind::classify(&message));
        let error_id = msg
            .get("@")
            .and_then(Json::as_str)
            .map(str::to_string)
            .unwrap_or_else(gen_error_id);
        let node_id = msg.get("node").and_then(Json::as_str).map(str::to_string);
        let field = msg.get("field").and_then(Json::as_str).map(str::to_string);
        let code = msg.get("code").and_then(Json::as_str).map(str::to_string);
        let context = msg
            .get("context")
            .and_then(Json::as_object)
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        Self {
            kind,
            message,
            code,
            node_id,
            field,
            context,
            timestamp: now_ms(),
            error_id,
        }
    }

    /// §4.13 backoff schedule, the single authority consumed by Tracker and RelayClient.
    pub fn retry_delay_ms(&self, attempt: u32) -> Option<u64> {
        match self.kind {
            ErrorKind::Timeout => Some((1000u64 * 2u64.pow(attempt.saturating_sub(1))).min(32_000)),
            ErrorKind::Network => Some((500u64 * attempt as u64).min(5_000)),
            _ => None,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn gen_error_id() -> String {
    crate::id::random_id(8)
}

/// Ring-buffered error log + per-kind counters, the single observability
/// sink every Peer/QueryEngine funnels DAMs and synthesized errors through.
pub struct ErrorHandler {
    inner: Mutex<ErrorHandlerInner>,
    recent_cap: usize,
    history_cap: usize,
}

struct ErrorHandlerInner {
    recent: VecDeque<GunError>,
    history: HashMap<String, GunError>,
    history_order: VecDeque<String>,
    counts: HashMap<ErrorKind, u64>,
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::with_capacity(100, 1000)
    }

    pub fn with_capacity(recent_cap: usize, history_cap: usize) -> Self {
        Self {
            inner: Mutex::new(ErrorHandlerInner {
                recent: VecDeque::with_capacity(recent_cap),
                history: HashMap::new(),
                history_order: VecDeque::new(),
                counts: HashMap::new(),
            }),
            recent_cap,
            history_cap,
        }
    }

    pub fn handle(&self, err: GunError) {
        tracing::warn!(kind = ?err.kind, error_id = %err.error_id, "{}", err.message);
        let mut inner = self.inner.lock();
        *inner.counts.entry(err.kind).or_insert(0) += 1;
        if inner.recent.len() >= self.recent_cap {
            inner.recent.pop_front();
        }
        inner.recent.push_back(err.clone());
        if inner.history_order.len() >= self.history_cap {
            if let Some(oldest) = inner.history_order.pop_front() {
                inner.history.remove(&oldest);
            }
        }
        inner.history_order.push_back(err.error_id.clone());
        inner.history.insert(err.error_id.clone(), err);
    }

    /// Alias matching the §4.13/§7 naming used by DAM ingress call sites.
    pub fn handle_dam(&self, err: GunError) {
        self.handle(err)
    }

    pub fn count(&self, kind: ErrorKind) -> u64 {
        *self.inner.lock().counts.get(&kind).unwrap_or(&0)
    }

    pub fn recent(&self) -> Vec<GunError> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    pub fn by_id(&self, error_id: &str) -> Option<GunError> {
        self.inner.lock().history.get(error_id).cloned()
    }

    pub fn should_retry(&self, err: &GunError) -> bool {
        err.kind.is_retryable()
    }

    pub fn retry_delay_ms(&self, err: &GunError, attempt: u32) -> Option<u64> {
        err.retry_delay_ms(attempt)
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dam_round_trip_preserves_kind_and_message() {
        let err = GunError::timeout("query", 5000);
        let encoded = err.encode_dam(Some("q-1"));
        let decoded = GunError::decode_dam(&encoded);
        assert_eq!(decoded.kind, ErrorKind::Timeout);
        assert_eq!(decoded.message, "Operation \"query\" timed out after 5000ms");
        assert_eq!(decoded.context.get("timeoutMs"), Some(&Json::from(5000)));
    }

    #[test]
    fn decode_without_type_classifies_by_keyword() {
        let msg = serde_json::json!({"dam": "Node \"users/bob\" not found", "@": "e-1"});
        let decoded = GunError::decode_dam(&msg);
        assert_eq!(decoded.kind, ErrorKind::NotFound);
    }

    #[test]
    fn decode_unknown_keyword_is_unknown() {
        let msg = serde_json::json!({"dam": "a wizard did it", "@": "e-2"});
        assert_eq!(GunError::decode_dam(&msg).kind, ErrorKind::Unknown);
    }

    #[test]
    fn retry_policy_matches_closed_set() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }

    #[test]
    fn timeout_backoff_doubles_and_caps() {
        let err = GunError::new(ErrorKind::Timeout, "x");
        assert_eq!(err.retry_delay_ms(1), Some(1000));
        assert_eq!(err.retry_delay_ms(2), Some(2000));
        assert_eq!(err.retry_delay_ms(6), Some(32_000));
        assert_eq!(err.retry_delay_ms(10), Some(32_000));
    }

    #[test]
    fn network_backoff_is_linear_and_caps() {
        let err = GunError::new(ErrorKind::Network, "x");
        assert_eq!(err.retry_delay_ms(1), Some(500));
        assert_eq!(err.retry_delay_ms(3), Some(1500));
        assert_eq!(err.retry_delay_ms(100), Some(5_000));
    }

    #[test]
    fn error_handler_buffers_and_counts() {
        let h = ErrorHandler::with_capacity(2, 2);
        h.handle(GunError::not_found("a"));
        h.handle(GunError::not_found("b"));
        h.handle(GunError::not_found("c"));
        assert_eq!(h.recent().len(), 2);
        assert_eq!(h.count(ErrorKind::NotFound), 3);
    }
}
