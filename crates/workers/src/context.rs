//! `NodeContext` — the JSON-shaped mapping attached to every task instance.
//!
//! It carries predecessor outputs (`pre_node_context`), workflow-global data
//! (`workflow_context`), engine metadata (`system`) and any injected external
//! event (`node_event`). Workers read and write it freely through nested-path
//! accessors; the engine persists it after every hook invocation.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

/// Reserved top-level key for injected external events.
pub const KEY_NODE_EVENT: &str = "node_event";
/// Reserved top-level key for engine-authored metadata.
pub const KEY_SYSTEM: &str = "system";
/// Reserved top-level key holding flattened predecessor contexts.
pub const KEY_PRE_NODE_CONTEXT: &str = "pre_node_context";
/// Reserved top-level key holding the instance-wide context.
pub const KEY_WORKFLOW_CONTEXT: &str = "workflow_context";
/// Key under `system` recording why a node ended up where it is.
pub const KEY_REASON: &str = "reason";
/// Key under `system` holding the most recent error message.
pub const KEY_LAST_ERROR: &str = "last_error";
/// Key under `system` holding the RFC 3339 time of the most recent error.
pub const KEY_LAST_ERROR_TIME: &str = "last_error_time";

/// A nested JSON object with path-based accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeContext {
    data: Map<String, Value>,
}

impl NodeContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a context from raw JSON bytes.
    ///
    /// Decoding is lenient: empty input, invalid JSON or a non-object
    /// document all yield an empty context rather than an error, so a
    /// corrupted row never wedges the engine.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::new();
        }
        match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(map)) => Self { data: map },
            _ => Self::new(),
        }
    }

    /// Build a context from a JSON value; non-objects yield an empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self { data: map },
            _ => Self::new(),
        }
    }

    /// Build a context from an existing map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { data: map }
    }

    /// Get a value at a nested path, e.g. `get(&["user", "name"])`.
    pub fn get(&self, keys: &[&str]) -> Option<&Value> {
        let (first, rest) = keys.split_first()?;
        let mut current = self.data.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    /// Get a string at a nested path.
    pub fn get_str(&self, keys: &[&str]) -> Option<&str> {
        self.get(keys)?.as_str()
    }

    /// Get an integer at a nested path. JSON numbers that arrive as floats
    /// (the usual fate of integers round-tripped through JSON) are truncated.
    pub fn get_i64(&self, keys: &[&str]) -> Option<i64> {
        match self.get(keys)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            _ => None,
        }
    }

    /// Get a float at a nested path; integer values are widened.
    pub fn get_f64(&self, keys: &[&str]) -> Option<f64> {
        self.get(keys)?.as_f64()
    }

    /// Get a boolean at a nested path.
    pub fn get_bool(&self, keys: &[&str]) -> Option<bool> {
        self.get(keys)?.as_bool()
    }

    /// Set a value at a nested path, creating intermediate objects as needed.
    /// Any non-object value along the path is overwritten by a fresh object.
    /// An empty path is a no-op.
    pub fn set(&mut self, keys: &[&str], value: impl Into<Value>) {
        let Some((last, parents)) = keys.split_last() else {
            return;
        };
        let mut current = &mut self.data;
        for key in parents {
            let entry = current
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Some(next) = entry.as_object_mut() else {
                return;
            };
            current = next;
        }
        current.insert(last.to_string(), value.into());
    }

    /// Remove the value at a nested path, if present.
    pub fn remove(&mut self, keys: &[&str]) {
        let Some((last, parents)) = keys.split_last() else {
            return;
        };
        let mut current = &mut self.data;
        for key in parents {
            match current.get_mut(*key).and_then(Value::as_object_mut) {
                Some(next) => current = next,
                None => return,
            }
        }
        current.remove(*last);
    }

    /// Serialize to JSON bytes. Serialization of a string-keyed JSON map
    /// cannot fail, so this is infallible.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.data).unwrap_or_default()
    }

    /// The context as a JSON value (cloned).
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Consume into the underlying map.
    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }

    /// Deserialize the whole context into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.data.clone()))
    }

    /// Shallow-merge `other` into this context; keys in `other` win.
    pub fn merge(&mut self, other: &NodeContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.data.clone()))
    }
}

impl From<Map<String, Value>> for NodeContext {
    fn from(map: Map<String, Value>) -> Self {
        Self::from_map(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(v: Value) -> NodeContext {
        NodeContext::from_value(v)
    }

    #[test]
    fn nested_get_and_set() {
        let mut c = NodeContext::new();
        c.set(&["user", "name"], "alice");
        c.set(&["user", "age"], 30);

        assert_eq!(c.get_str(&["user", "name"]), Some("alice"));
        assert_eq!(c.get_i64(&["user", "age"]), Some(30));
        assert!(c.get(&["user", "missing"]).is_none());
        assert!(c.get(&["missing", "name"]).is_none());
    }

    #[test]
    fn set_overwrites_non_object_in_path() {
        let mut c = ctx(json!({ "a": "scalar" }));
        c.set(&["a", "b"], 1);
        assert_eq!(c.get_i64(&["a", "b"]), Some(1));
    }

    #[test]
    fn empty_path_is_noop() {
        let mut c = NodeContext::new();
        c.set(&[], "ignored");
        assert!(c.is_empty());
        c.remove(&[]);
    }

    #[test]
    fn numeric_coercion() {
        let c = ctx(json!({ "int": 7, "float": 7.9, "big": 3.0 }));
        assert_eq!(c.get_i64(&["int"]), Some(7));
        // floats truncate on integer access
        assert_eq!(c.get_i64(&["float"]), Some(7));
        assert_eq!(c.get_f64(&["int"]), Some(7.0));
        assert_eq!(c.get_f64(&["big"]), Some(3.0));
        assert!(c.get_bool(&["int"]).is_none());
    }

    #[test]
    fn lenient_byte_decoding() {
        assert!(NodeContext::from_bytes(b"").is_empty());
        assert!(NodeContext::from_bytes(b"not json at all").is_empty());
        assert!(NodeContext::from_bytes(b"[1,2,3]").is_empty());

        let c = NodeContext::from_bytes(br#"{"k":"v"}"#);
        assert_eq!(c.get_str(&["k"]), Some("v"));
    }

    #[test]
    fn round_trip_bytes() {
        let mut c = NodeContext::new();
        c.set(&["outer", "inner"], json!([1, 2]));
        let restored = NodeContext::from_bytes(&c.to_bytes());
        assert_eq!(restored, c);
    }

    #[test]
    fn remove_nested() {
        let mut c = ctx(json!({ "a": { "b": 1, "c": 2 } }));
        c.remove(&["a", "b"]);
        assert!(c.get(&["a", "b"]).is_none());
        assert_eq!(c.get_i64(&["a", "c"]), Some(2));
        // removing a missing path is fine
        c.remove(&["x", "y"]);
    }

    #[test]
    fn merge_overwrites_top_level() {
        let mut base = ctx(json!({ "keep": 1, "clobber": 1 }));
        let over = ctx(json!({ "clobber": 2, "extra": 3 }));
        base.merge(&over);
        assert_eq!(base.get_i64(&["keep"]), Some(1));
        assert_eq!(base.get_i64(&["clobber"]), Some(2));
        assert_eq!(base.get_i64(&["extra"]), Some(3));
    }

    #[test]
    fn decode_into_struct() {
        #[derive(serde::Deserialize)]
        struct Payload {
            approval_result: String,
        }
        let c = ctx(json!({ "approval_result": "approved" }));
        let p: Payload = c.decode().expect("decodes");
        assert_eq!(p.approval_result, "approved");
    }
}
