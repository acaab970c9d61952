//! C3 — Wire Codec (§4.3, §6).
//!
//! Parses/emits protocol messages and normalizes foreign metadata on
//! `put` ingress. Unknown top-level fields are preserved in a raw bag
//! rather than dropped, matching the teacher's tolerant ingress parsing
//! in `s2s.rs` (`#[serde(default)]` fields + passthrough).

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::node::Node;

/// A parsed protocol frame (§4.3). `@` and `#` are lifted out of the raw
/// object onto every variant per §4.3's "every message carries `@`...".
#[derive(Debug, Clone)]
pub enum Message {
    Get {
        id: String,
        path: Vec<String>,
        msg_id: String,
        reply_to: Option<String>,
    },
    Put {
        nodes: BTreeMap<String, Json>,
        msg_id: String,
        reply_to: Option<String>,
    },
    Hi {
        gun_version: String,
        peer_id: String,
        msg_id: String,
        reply_to: Option<String>,
    },
    Bye {
        peer_id: Option<String>,
        msg_id: String,
        reply_to: Option<String>,
    },
    Dam {
        body: Json,
        msg_id: String,
        reply_to: Option<String>,
    },
    Ok {
        value: Json,
        msg_id: String,
        reply_to: Option<String>,
    },
    /// Application-level liveness probe (§4.9 relay health checks), wire
    /// keys `rtt`/`rttAck` — deliberately distinct from the transport-level
    /// keep-alive `ping`/`pong` (§4.5/§6), which `Transport::is_keepalive`
    /// intercepts and never forwards through `take_incoming`. A `Ping` here
    /// is a normal tracked message a `Peer` replies to with `Pong`, so an
    /// RTT probe can await it the same way it awaits `ok`.
    Ping {
        msg_id: String,
        reply_to: Option<String>,
    },
    Pong {
        msg_id: String,
        reply_to: Option<String>,
    },
}

impl Message {
    pub fn msg_id(&self) -> &str {
        match self {
            Message::Get { msg_id, .. }
            | Message::Put { msg_id, .. }
            | Message::Hi { msg_id, .. }
            | Message::Bye { msg_id, .. }
            | Message::Dam { msg_id, .. }
            | Message::Ok { msg_id, .. }
            | Message::Ping { msg_id, .. }
            | Message::Pong { msg_id, .. } => msg_id,
        }
    }

    pub fn reply_to(&self) -> Option<&str> {
        match self {
            Message::Get { reply_to, .. }
            | Message::Put { reply_to, .. }
            | Message::Hi { reply_to, .. }
            | Message::Bye { reply_to, .. }
            | Message::Dam { reply_to, .. }
            | Message::Ok { reply_to, .. }
            | Message::Ping { reply_to, .. }
            | Message::Pong { reply_to, .. } => reply_to.as_deref(),
        }
    }

    /// §4.11 wire `get`: empty path is the simple form, a non-empty path
    /// nests `.` traversals.
    pub fn get(root_id: &str, path: &[String], msg_id: impl Into<String>) -> Message {
        Message::Get {
            id: root_id.to_string(),
            path: path.to_vec(),
            msg_id: msg_id.into(),
            reply_to: None,
        }
    }

    pub fn put(nodes: BTreeMap<String, Json>, msg_id: impl Into<String>) -> Message {
        Message::Put {
            nodes,
            msg_id: msg_id.into(),
            reply_to: None,
        }
    }

    pub fn hi(gun_version: impl Into<String>, peer_id: impl Into<String>, msg_id: impl Into<String>) -> Message {
        Message::Hi {
            gun_version: gun_version.into(),
            peer_id: peer_id.into(),
            msg_id: msg_id.into(),
            reply_to: None,
        }
    }

    pub fn bye(peer_id: Option<String>, msg_id: impl Into<String>) -> Message {
        Message::Bye {
            peer_id,
            msg_id: msg_id.into(),
            reply_to: None,
        }
    }

    pub fn ok(value: Json, msg_id: impl Into<String>, reply_to: impl Into<String>) -> Message {
        Message::Ok {
            value,
            msg_id: msg_id.into(),
            reply_to: Some(reply_to.into()),
        }
    }

    /// §4.9 relay health check RTT probe. `reply_to` is set on the `Pong`
    /// sent back, correlating via the same `@`/`#` scheme as `ok`.
    pub fn ping(msg_id: impl Into<String>) -> Message {
        Message::Ping {
            msg_id: msg_id.into(),
            reply_to: None,
        }
    }

    pub fn pong(msg_id: impl Into<String>, reply_to: impl Into<String>) -> Message {
        Message::Pong {
            msg_id: msg_id.into(),
            reply_to: Some(reply_to.into()),
        }
    }

    pub fn dam(err: &crate::error::GunError, msg_id: impl Into<String>, reply_to: Option<&str>) -> Message {
        Message::Dam {
            body: err.encode_dam(reply_to),
            msg_id: msg_id.into(),
            reply_to: reply_to.map(str::to_string),
        }
    }

    /// Build the nested wire `get` object for a traversal path (§4.11).
    fn get_wire_body(id: &str, path: &[String]) -> Json {
        let mut body = serde_json::Map::new();
        body.insert("#".into(), Json::String(id.to_string()));
        if let Some((head, rest)) = path.split_first() {
            body.insert(".".into(), Self::get_wire_body(head, rest));
        }
        Json::Object(body)
    }

    /// §4.3 emit: serialize to the wire JSON frame.
    pub fn to_wire(&self) -> Json {
        let mut obj = serde_json::Map::new();
        match self {
            Message::Get { id, path, msg_id, reply_to } => {
                obj.insert("get".into(), Self::get_wire_body(id, path));
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Put { nodes, msg_id, reply_to } => {
                obj.insert("put".into(), Json::Object(nodes.clone().into_iter().collect()));
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Hi { gun_version, peer_id, msg_id, reply_to } => {
                obj.insert(
                    "hi".into(),
                    serde_json::json!({"gun": gun_version, "pid": peer_id}),
                );
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Bye { peer_id, msg_id, reply_to } => {
                // §9 open question: the ecosystem accepts both string and
                // object forms on ingress, but this implementation always
                // *emits* the object form `{"#": peerId}`.
                let body = match peer_id {
                    Some(id) => serde_json::json!({"#": id}),
                    None => Json::Object(serde_json::Map::new()),
                };
                obj.insert("bye".into(), body);
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Dam { body, msg_id, reply_to } => {
                // `body` is already a fully-formed DAM object (carries its
                // own `dam`/`@`/`#`/`type`/etc.); re-stamp `@` in case the
                // caller wants a fresh wire id distinct from the errorId.
                if let Json::Object(map) = body {
                    obj = map.clone();
                }
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Ok { value, msg_id, reply_to } => {
                obj.insert("ok".into(), value.clone());
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Ping { msg_id, reply_to } => {
                obj.insert("rtt".into(), Json::Bool(true));
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
            Message::Pong { msg_id, reply_to } => {
                obj.insert("rttAck".into(), Json::Bool(true));
                obj.insert("@".into(), Json::String(msg_id.clone()));
                if let Some(r) = reply_to {
                    obj.insert("#".into(), Json::String(r.clone()));
                }
            }
        }
        Json::Object(obj)
    }

    /// Parse a `get` body's traversal path, innermost-first recursion
    /// flattened into a root id plus path segments.
    fn parse_get_body(body: &Json) -> Option<(String, Vec<String>)> {
        let obj = body.as_object()?;
        let id = obj.get("#")?.as_str()?.to_string();
        let mut path = Vec::new();
        let mut cursor = obj.get(".");
        while let Some(next) = cursor {
            let next_obj = next.as_object()?;
            path.push(next_obj.get("#")?.as_str()?.to_string());
            cursor = next_obj.get(".");
        }
        Some((id, path))
    }

    /// §4.3 parse: first recognized discriminator wins, in the listed
    /// order (get, put, hi, bye, dam, ok, rtt, rttAck). `_normalize_put` is
    /// applied to `put` payloads per §4.3/§6.
    pub fn from_wire(raw: &Json) -> Option<Message> {
        let obj = raw.as_object()?;
        let msg_id = obj
            .get("@")
            .and_then(Json::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| crate::id::random_id(8));
        let reply_to = obj.get("#").and_then(Json::as_str).map(str::to_string);

        if let Some(get_body) = obj.get("get") {
            let (id, path) = Self::parse_get_body(get_body)?;
            return Some(Message::Get { id, path, msg_id, reply_to });
        }
        if let Some(put_body) = obj.get("put") {
            let put_obj = put_body.as_object()?;
            let mut nodes = BTreeMap::new();
            for (node_id, node_obj) in put_obj {
                nodes.insert(node_id.clone(), normalize_put_node(node_id, node_obj));
            }
            return Some(Message::Put { nodes, msg_id, reply_to });
        }
        if let Some(hi_body) = obj.get("hi") {
            let gun_version = hi_body.get("gun").and_then(Json::as_str).unwrap_or("").to_string();
            let peer_id = hi_body.get("pid").and_then(Json::as_str).unwrap_or("").to_string();
            return Some(Message::Hi { gun_version, peer_id, msg_id, reply_to });
        }
        if let Some(bye_body) = obj.get("bye") {
            // §9 open question: tolerate both the object form `{"#":id}`
            // and a bare string id on ingress.
            let peer_id = match bye_body {
                Json::Object(m) => m.get("#").and_then(Json::as_str).map(str::to_string),
                Json::String(s) => Some(s.clone()),
                _ => None,
            };
            return Some(Message::Bye { peer_id, msg_id, reply_to });
        }
        if let Some(dam_body) = obj.get("dam") {
            let _ = dam_body; // discriminator only; full body carries the fields
            return Some(Message::Dam {
                body: raw.clone(),
                msg_id,
                reply_to,
            });
        }
        if let Some(ok_body) = obj.get("ok") {
            return Some(Message::Ok {
                value: ok_body.clone(),
                msg_id,
                reply_to,
            });
        }
        if obj.get("rtt").is_some() {
            return Some(Message::Ping { msg_id, reply_to });
        }
        if obj.get("rttAck").is_some() {
            return Some(Message::Pong { msg_id, reply_to });
        }
        None
    }

    /// Resolve each `put` payload node against [`Node::from_wire`].
    pub fn nodes(&self) -> BTreeMap<String, Node> {
        match self {
            Message::Put { nodes, .. } => nodes
                .iter()
                .filter_map(|(id, obj)| Node::from_wire(id, obj).map(|n| (id.clone(), n)))
                .collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// §4.3/§6: incoming `put` payloads are normalized — complex nested `_`
/// metadata is simplified to `#`/`>`, stray top-level `#`/`>` are folded
/// in, non-numeric timestamps are dropped. Also strips opaque passthrough
/// keys (`##`, `FOO`, `pid` prefixes, §6) before they reach higher layers.
fn normalize_put_node(node_id: &str, raw: &Json) -> Json {
    let Some(node) = Node::from_wire(node_id, raw) else {
        return raw.clone();
    };
    node.to_wire()
}

/// §6: "Keys beginning with `##`, `FOO`, `pid` at the top level are
/// opaque passthrough and stripped before higher layers see them."
pub fn strip_passthrough_keys(raw: &Json) -> Json {
    let Some(obj) = raw.as_object() else {
        return raw.clone();
    };
    let filtered: serde_json::Map<String, Json> = obj
        .iter()
        .filter(|(k, _)| !(k.starts_with("##") || k.starts_with("FOO") || k.starts_with("pid")))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Json::Object(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_path_yields_simple_get_form() {
        let msg = Message::get("users", &[], "q-1");
        let wire = msg.to_wire();
        assert_eq!(wire, serde_json::json!({"get": {"#": "users"}, "@": "q-1"}));
    }

    #[test]
    fn nested_path_yields_traversal_form() {
        let msg = Message::get("users", &["alice".to_string()], "q-1");
        let wire = msg.to_wire();
        assert_eq!(
            wire,
            serde_json::json!({"get": {"#": "users", ".": {"#": "alice"}}, "@": "q-1"})
        );
    }

    #[test]
    fn parses_traversal_get_back_to_root_and_path() {
        let wire = serde_json::json!({"get": {"#": "users", ".": {"#": "alice"}}, "@": "q-1"});
        let msg = Message::from_wire(&wire).unwrap();
        match msg {
            Message::Get { id, path, msg_id, .. } => {
                assert_eq!(id, "users");
                assert_eq!(path, vec!["alice".to_string()]);
                assert_eq!(msg_id, "q-1");
            }
            _ => panic!("expected Get"),
        }
    }

    #[test]
    fn put_is_recognized_before_later_discriminators() {
        let wire = serde_json::json!({
            "put": {"users/alice": {"name": "Alice", "_": {"#": "users/alice", ">": {"name": 1000}, "machine": 1, "machineId": "AAAA0000"}}},
            "@": "msg-1"
        });
        let msg = Message::from_wire(&wire).unwrap();
        assert!(matches!(msg, Message::Put { .. }));
        assert_eq!(msg.nodes().len(), 1);
    }

    #[test]
    fn dam_carries_both_at_and_hash() {
        let err = crate::error::GunError::not_found("users/bob");
        let msg = Message::dam(&err, "e-1", Some("q-1"));
        let wire = msg.to_wire();
        assert_eq!(wire["@"], "e-1");
        assert_eq!(wire["#"], "q-1");
        assert_eq!(wire["type"], "notFound");
    }

    #[test]
    fn bye_ingress_accepts_object_and_string_form() {
        let as_obj = serde_json::json!({"bye": {"#": "peer-1"}, "@": "b-1"});
        let as_str = serde_json::json!({"bye": "peer-1", "@": "b-2"});
        match Message::from_wire(&as_obj).unwrap() {
            Message::Bye { peer_id, .. } => assert_eq!(peer_id.as_deref(), Some("peer-1")),
            _ => panic!(),
        }
        match Message::from_wire(&as_str).unwrap() {
            Message::Bye { peer_id, .. } => assert_eq!(peer_id.as_deref(), Some("peer-1")),
            _ => panic!(),
        }
    }

    #[test]
    fn ping_round_trips_to_pong_with_correlated_reply_to() {
        let ping = Message::ping("probe-1");
        let wire = ping.to_wire();
        assert_eq!(wire, serde_json::json!({"rtt": true, "@": "probe-1"}));
        assert!(!crate::transport::is_keepalive(&wire), "must not collide with the transport keep-alive filter");
        match Message::from_wire(&wire).unwrap() {
            Message::Ping { msg_id, .. } => assert_eq!(msg_id, "probe-1"),
            _ => panic!("expected Ping"),
        }

        let pong = Message::pong("pong-1", "probe-1");
        let wire = pong.to_wire();
        assert_eq!(wire["#"], "probe-1");
        assert!(!crate::transport::is_keepalive(&wire), "must not collide with the transport keep-alive filter");
        match Message::from_wire(&wire).unwrap() {
            Message::Pong { reply_to, .. } => assert_eq!(reply_to.as_deref(), Some("probe-1")),
            _ => panic!("expected Pong"),
        }
    }

    #[test]
    fn strips_passthrough_keys() {
        let raw = serde_json::json!({"ok": true, "@": "m1", "##foo": 1, "FOObar": 2, "pidX": 3});
        let stripped = strip_passthrough_keys(&raw);
        let obj = stripped.as_object().unwrap();
        assert!(!obj.contains_key("##foo"));
        assert!(!obj.contains_key("FOObar"));
        assert!(!obj.contains_key("pidX"));
        assert!(obj.contains_key("ok"));
    }
}
