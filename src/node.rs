//! C1 — HAM State & Node Model (§3, §4.1).
//!
//! A [`Node`] is an id-addressed record of [`Value`]s plus an [`Envelope`]
//! carrying the per-field HAM timestamps. [`Node::merge`] is the
//! associative/commutative/idempotent conflict resolver every replica
//! applies independently, per field (§4.1, §8).

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A scalar or link field value (§3, §9 "Dynamic field types").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    /// All numeric fields share one representation; HAM compares by wire encoding.
    Number(f64),
    String(String),
    /// The single permitted nested shape: `{"#": target_id}` (§3).
    Link(LinkRef),
}

/// The link wire shape `{"#": id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRef {
    #[serde(rename = "#")]
    pub id: String,
}

impl Value {
    pub fn link(id: impl Into<String>) -> Self {
        Value::Link(LinkRef { id: id.into() })
    }

    pub fn as_link(&self) -> Option<&str> {
        match self {
            Value::Link(l) => Some(&l.id),
            _ => None,
        }
    }

    /// Canonical textual encoding used for the §4.1 tiebreak comparison —
    /// "the same JSON-shaped textual form used on the wire".
    pub fn canonical_encoding(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The `_` envelope carried by every node (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "#")]
    pub node_id: String,
    #[serde(rename = ">")]
    pub timestamps: BTreeMap<String, u64>,
    pub machine: u64,
    #[serde(rename = "machineId")]
    pub machine_id: String,
}

/// A node: a string id, a field map, and its envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
    pub envelope: Envelope,
}

/// Reasons a node fails `validate` (§4.2, §8 "boundary behavior").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingEnvelope,
    EnvelopeIdMismatch { expected: String, found: String },
    TimestampKeysMismatch { missing: Vec<String>, extra: Vec<String> },
}

impl Node {
    /// §4.1 total order over a field's (timestamp, canonical-value) tuple.
    /// `max` under this order is associative/commutative/idempotent, which
    /// is what makes per-field HAM merge associative/commutative/idempotent
    /// as a whole (§8).
    fn ham_key(ts: u64, value: &Value) -> (u64, String) {
        (ts, value.canonical_encoding())
    }

    /// §4.1: merge two nodes of the same id, independently per field.
    /// `machine`/`machineId` on the result identify the local replica
    /// (the caller), not any field's writer.
    pub fn merge(local: &Node, incoming: &Node, local_identity: (&str, u64)) -> Node {
        debug_assert_eq!(local.id, incoming.id, "merge requires matching node ids");
        let mut fields = BTreeMap::new();
        let mut timestamps = BTreeMap::new();

        let mut all_keys: Vec<&String> = local.fields.keys().chain(incoming.fields.keys()).collect();
        all_keys.sort();
        all_keys.dedup();

        for key in all_keys {
            let local_entry = local
                .fields
                .get(key)
                .map(|v| (local.envelope.timestamps.get(key).copied().unwrap_or(0), v));
            let incoming_entry = incoming
                .fields
                .get(key)
                .map(|v| (incoming.envelope.timestamps.get(key).copied().unwrap_or(0), v));

            let winner = match (local_entry, incoming_entry) {
                (Some((lt, lv)), Some((it, iv))) => {
                    if Self::ham_key(it, iv) >= Self::ham_key(lt, lv) {
                        (it, iv.clone())
                    } else {
                        (lt, lv.clone())
                    }
                }
                (Some((lt, lv)), None) => (lt, lv.clone()),
                (None, Some((it, iv))) => (it, iv.clone()),
                (None, None) => unreachable!("key came from one of the two field maps"),
            };
            fields.insert(key.clone(), winner.1);
            timestamps.insert(key.clone(), winner.0);
        }

        Node {
            id: local.id.clone(),
            fields,
            envelope: Envelope {
                node_id: local.id.clone(),
                timestamps,
                machine: local_identity.1,
                machine_id: local_identity.0.to_string(),
            },
        }
    }

    /// §4.2/§8: every `_` key must equal the id, and `>` keys must equal
    /// the non-`_` field keys exactly.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.envelope.node_id != self.id {
            errors.push(ValidationError::EnvelopeIdMismatch {
                expected: self.id.clone(),
                found: self.envelope.node_id.clone(),
            });
        }
        let field_keys: std::collections::BTreeSet<&String> = self.fields.keys().collect();
        let ts_keys: std::collections::BTreeSet<&String> = self.envelope.timestamps.keys().collect();
        let missing: Vec<String> = field_keys.difference(&ts_keys).map(|s| s.to_string()).collect();
        let extra: Vec<String> = ts_keys.difference(&field_keys).map(|s| s.to_string()).collect();
        if !missing.is_empty() || !extra.is_empty() {
            errors.push(ValidationError::TimestampKeysMismatch { missing, extra });
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// §4.3/§4.2 `toWire`: a compliant node serializes bit-identically,
    /// fields plus `_` at the top level.
    pub fn to_wire(&self) -> Json {
        let mut obj = serde_json::Map::new();
        for (k, v) in &self.fields {
            obj.insert(k.clone(), serde_json::to_value(v).unwrap_or(Json::Null));
        }
        obj.insert("_".into(), serde_json::to_value(&self.envelope).unwrap_or(Json::Null));
        Json::Object(obj)
    }

    /// §4.2/§4.3 `fromWire`: tolerant of foreign implementations placing
    /// stray top-level `#`/`>` outside `_`; folds them in and drops
    /// non-numeric timestamp entries.
    pub fn from_wire(id: &str, obj: &Json) -> Option<Node> {
        let map = obj.as_object()?;
        let mut fields = BTreeMap::new();
        let mut stray_id: Option<String> = None;
        let mut stray_ts: BTreeMap<String, u64> = BTreeMap::new();

        for (k, v) in map {
            match k.as_str() {
                "_" => continue,
                "#" => stray_id = v.as_str().map(str::to_string),
                ">" => {
                    if let Some(ts_obj) = v.as_object() {
                        for (fk, fv) in ts_obj {
                            if let Some(n) = fv.as_u64() {
                                stray_ts.insert(fk.clone(), n);
                            }
                        }
                    }
                }
                _ => {
                    if let Ok(value) = serde_json::from_value::<Value>(v.clone()) {
                        fields.insert(k.clone(), value);
                    }
                }
            }
        }

        let envelope = match map.get("_").and_then(Json::as_object) {
            Some(env_obj) => {
                let node_id = env_obj
                    .get("#")
                    .and_then(Json::as_str)
                    .map(str::to_string)
                    .or(stray_id)
                    .unwrap_or_else(|| id.to_string());
                let mut timestamps: BTreeMap<String, u64> = env_obj
                    .get(">")
                    .and_then(Json::as_object)
                    .map(|ts| {
                        ts.iter()
                            .filter_map(|(k, v)| v.as_u64().map(|n| (k.clone(), n)))
                            .collect()
                    })
                    .unwrap_or_default();
                timestamps.extend(stray_ts);
                let machine = env_obj.get("machine").and_then(Json::as_u64).unwrap_or(0);
                let machine_id = env_obj
                    .get("machineId")
                    .and_then(Json::as_str)
                    .unwrap_or("")
                    .to_string();
                Envelope {
                    node_id,
                    timestamps,
                    machine,
                    machine_id,
                }
            }
            None if stray_id.is_some() || !stray_ts.is_empty() => Envelope {
                node_id: stray_id.unwrap_or_else(|| id.to_string()),
                timestamps: stray_ts,
                machine: 0,
                machine_id: String::new(),
            },
            None => return None,
        };

        Some(Node {
            id: id.to_string(),
            fields,
            envelope,
        })
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.canonical_encoding().cmp(&other.canonical_encoding()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, field: &str, value: Value, ts: u64) -> Node {
        let mut fields = BTreeMap::new();
        fields.insert(field.to_string(), value);
        let mut timestamps = BTreeMap::new();
        timestamps.insert(field.to_string(), ts);
        Node {
            id: id.to_string(),
            fields,
            envelope: Envelope {
                node_id: id.to_string(),
                timestamps,
                machine: 1,
                machine_id: "AAAA0000".into(),
            },
        }
    }

    #[test]
    fn later_timestamp_wins() {
        let a = node("users/alice", "name", Value::String("Alice".into()), 1000);
        let b = node("users/alice", "name", Value::String("Bob".into()), 2000);
        let merged = Node::merge(&a, &b, ("LOCAL001", 5));
        assert_eq!(merged.fields["name"], Value::String("Bob".into()));
        assert_eq!(merged.envelope.timestamps["name"], 2000);
    }

    #[test]
    fn tie_breaks_lexicographically_greater() {
        let a = node("users/alice", "name", Value::String("Alice".into()), 1000);
        let b = node("users/alice", "name", Value::String("Bob".into()), 1000);
        let merged = Node::merge(&a, &b, ("LOCAL001", 5));
        // "\"Bob\"" > "\"Alice\"" lexicographically.
        assert_eq!(merged.fields["name"], Value::String("Bob".into()));
    }

    #[test]
    fn equal_timestamp_and_value_is_unchanged() {
        let a = node("users/alice", "name", Value::String("Alice".into()), 1000);
        let b = node("users/alice", "name", Value::String("Alice".into()), 1000);
        let merged = Node::merge(&a, &b, ("LOCAL001", 5));
        assert_eq!(merged.fields["name"], Value::String("Alice".into()));
    }

    #[test]
    fn merge_is_commutative_associative_idempotent() {
        let a = node("x", "f", Value::String("a".into()), 1000);
        let b = node("x", "f", Value::String("b".into()), 1000);
        let c = node("x", "f", Value::Number(3.0), 2000);

        let ab = Node::merge(&a, &b, ("L", 1));
        let ba = Node::merge(&b, &a, ("L", 1));
        assert_eq!(ab.fields, ba.fields);

        let ab_c = Node::merge(&Node::merge(&a, &b, ("L", 1)), &c, ("L", 1));
        let a_bc = Node::merge(&a, &Node::merge(&b, &c, ("L", 1)), ("L", 1));
        assert_eq!(ab_c.fields, a_bc.fields);

        let aa = Node::merge(&a, &a, ("L", 1));
        assert_eq!(aa.fields, a.fields);
    }

    #[test]
    fn validate_rejects_missing_envelope_timestamp_keys() {
        let mut n = node("x", "f", Value::Number(1.0), 1);
        n.envelope.timestamps.clear();
        let err = n.validate().unwrap_err();
        assert!(matches!(err[0], ValidationError::TimestampKeysMismatch { .. }));
    }

    #[test]
    fn from_wire_round_trips_compliant_node() {
        let n = node("users/alice", "name", Value::String("Alice".into()), 1000);
        let wire = n.to_wire();
        let parsed = Node::from_wire("users/alice", &wire).unwrap();
        assert_eq!(parsed, n);
    }

    #[test]
    fn from_wire_folds_stray_top_level_metadata() {
        let obj = serde_json::json!({
            "name": "Alice",
            "#": "users/alice",
            ">": {"name": 1000, "bogus": "not-a-number"}
        });
        let parsed = Node::from_wire("users/alice", &obj).unwrap();
        assert_eq!(parsed.envelope.node_id, "users/alice");
        assert_eq!(parsed.envelope.timestamps.get("name"), Some(&1000));
        assert!(!parsed.envelope.timestamps.contains_key("bogus"));
    }
}
