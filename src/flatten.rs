//! C10 — Data Flattener (§4.10, §8 scenario 6).
//!
//! Decomposes nested JSON objects into a graph of linked nodes before
//! storage, and re-composes them on read. Lists are out of scope (§4.10)
//! and pass through as opaque scalars wherever encountered.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde_json::Value as Json;

use crate::error::GunError;
use crate::node::Value;

/// A single node's worth of flattened fields, keyed by field name.
pub type FlatNode = BTreeMap<String, Value>;

/// Pre-write: walk a user-supplied JSON object, turning nested objects
/// into `{"#": parent_id + "/" + key}` links, each recursively flattened
/// into its own entry. Scalars and existing link objects pass through.
/// Returns `(root_id, {node_id -> fields})`.
pub fn flatten(root_id: &str, value: &Json) -> BTreeMap<String, FlatNode> {
    let mut out = BTreeMap::new();
    flatten_into(root_id, value, &mut out);
    out
}

fn flatten_into(node_id: &str, value: &Json, out: &mut BTreeMap<String, FlatNode>) {
    let mut fields = FlatNode::new();
    if let Json::Object(map) = value {
        for (key, v) in map {
            match v {
                Json::Object(link_obj) if is_link_object(link_obj) => {
                    let target = link_obj.get("#").and_then(Json::as_str).unwrap_or_default();
                    fields.insert(key.clone(), Value::link(target));
                }
                Json::Object(_) => {
                    let child_id = format!("{node_id}/{key}");
                    flatten_into(&child_id, v, out);
                    fields.insert(key.clone(), Value::link(child_id));
                }
                Json::Null => {
                    fields.insert(key.clone(), Value::Null);
                }
                Json::Bool(b) => {
                    fields.insert(key.clone(), Value::Bool(*b));
                }
                Json::Number(n) => {
                    fields.insert(key.clone(), Value::Number(n.as_f64().unwrap_or(0.0)));
                }
                Json::String(s) => {
                    fields.insert(key.clone(), Value::String(s.clone()));
                }
                // Lists are out of scope (§4.10): treated as an opaque
                // scalar by round-tripping the raw JSON as a string.
                Json::Array(_) => {
                    fields.insert(key.clone(), Value::String(v.to_string()));
                }
            }
        }
    }
    out.insert(node_id.to_string(), fields);
}

fn is_link_object(obj: &serde_json::Map<String, Json>) -> bool {
    obj.len() == 1 && obj.contains_key("#")
}

/// A one-node-at-a-time resolver the Flattener uses for unflatten; the
/// real implementation is backed by [`crate::storage::Storage`].
#[async_trait]
pub trait NodeResolver: Send + Sync {
    async fn resolve(&self, id: &str) -> Result<Option<FlatNode>, GunError>;
}

/// Post-read: resolve each link by one storage lookup and rebuild the
/// nested tree. Cycles are broken by a visited-set: a link back to an
/// already-visited id is emitted verbatim rather than recursed into
/// (§4.10, §9 "Cyclic graphs").
pub async fn unflatten(root_id: &str, resolver: &dyn NodeResolver) -> Result<Json, GunError> {
    let mut visited = HashSet::new();
    unflatten_rec(root_id, resolver, &mut visited).await
}

fn unflatten_rec<'a>(
    node_id: &'a str,
    resolver: &'a dyn NodeResolver,
    visited: &'a mut HashSet<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Json, GunError>> + Send + 'a>> {
    Box::pin(async move {
        if visited.contains(node_id) {
            return Ok(serde_json::json!({"#": node_id}));
        }
        visited.insert(node_id.to_string());

        let fields = resolver.resolve(node_id).await?.ok_or_else(|| GunError::not_found(node_id))?;
        let mut obj = serde_json::Map::new();
        for (key, value) in fields {
            let json_value = match value {
                Value::Link(link) => unflatten_rec(&link.id, resolver, visited).await?,
                other => serde_json::to_value(other).unwrap_or(Json::Null),
            };
            obj.insert(key, json_value);
        }
        Ok(Json::Object(obj))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    struct MapResolver(RwLock<HashMap<String, FlatNode>>);

    #[async_trait]
    impl NodeResolver for MapResolver {
        async fn resolve(&self, id: &str) -> Result<Option<FlatNode>, GunError> {
            Ok(self.0.read().await.get(id).cloned())
        }
    }

    #[test]
    fn flatten_decomposes_nested_objects_into_linked_nodes() {
        let input = serde_json::json!({"user": {"profile": {"email": "a@x"}}});
        let nodes = flatten("r", &input);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes["r"]["user"], Value::link("r/user"));
        assert_eq!(nodes["r/user"]["profile"], Value::link("r/user/profile"));
        assert_eq!(
            nodes["r/user/profile"]["email"],
            Value::String("a@x".to_string())
        );
    }

    #[tokio::test]
    async fn unflatten_round_trips_flatten_output() {
        let input = serde_json::json!({"user": {"profile": {"email": "a@x"}}});
        let nodes = flatten("r", &input);
        let resolver = MapResolver(RwLock::new(nodes));
        let rebuilt = unflatten("r", &resolver).await.unwrap();
        assert_eq!(rebuilt, input);
    }

    #[tokio::test]
    async fn unflatten_emits_link_verbatim_on_cycle() {
        let mut nodes = BTreeMap::new();
        let mut a = FlatNode::new();
        a.insert("next".to_string(), Value::link("b"));
        let mut b = FlatNode::new();
        b.insert("next".to_string(), Value::link("a"));
        nodes.insert("a".to_string(), a);
        nodes.insert("b".to_string(), b);
        let resolver = MapResolver(RwLock::new(nodes));
        let rebuilt = unflatten("a", &resolver).await.unwrap();
        // a -> b -> a(visited) : inner "a" stays a link rather than recursing forever.
        assert_eq!(rebuilt["next"]["next"], serde_json::json!({"#": "a"}));
    }

    #[test]
    fn flatten_passes_scalars_and_existing_links_through() {
        let input = serde_json::json!({"name": "Alice", "friend": {"#": "users/bob"}});
        let nodes = flatten("users/alice", &input);
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes["users/alice"]["name"], Value::String("Alice".into()));
        assert_eq!(nodes["users/alice"]["friend"], Value::link("users/bob"));
    }
}
