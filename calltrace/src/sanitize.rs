// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Bounded snapshots of user values.
//!
//! Everything embedded into a [`TraceEvent`](crate::event::TraceEvent) or a
//! request payload goes through this module first. The caps are deliberate:
//! the core must never hold references to user-controlled data longer than
//! one flush, and a snapshot is never allowed to grow without bound.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use serde_json::json;
use serde_json::Value;

/// Caps applied while sanitizing. The defaults match the recommended
/// conservative limits: 3 levels deep, 20 keys per object, 20 items per
/// collection, 2 KiB per string.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_depth: usize,
    pub max_keys: usize,
    pub max_items: usize,
    pub max_string: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_keys: 20,
            max_items: 20,
            max_string: 2048,
        }
    }
}

pub const TRUNCATED: &str = "[Truncated]";
pub const PENDING_FUTURE: &str = "[Promise pending]";

/// Sanitizer with a fixed set of [`Limits`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Sanitizer {
    limits: Limits,
}

impl Sanitizer {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    /// Sanitize an arbitrary JSON value: bounded depth, keys, items and
    /// string length. Values past the depth cap collapse into the
    /// [`TRUNCATED`] sentinel.
    pub fn value(&self, value: &Value) -> Value {
        self.value_at(value, 0)
    }

    fn value_at(&self, value: &Value, depth: usize) -> Value {
        match value {
            Value::String(s) => Value::String(self.clip(s)),
            Value::Object(map) => {
                if depth >= self.limits.max_depth {
                    return Value::String(TRUNCATED.to_string());
                }
                let mut out = serde_json::Map::new();
                for (i, (k, v)) in map.iter().enumerate() {
                    if i >= self.limits.max_keys {
                        out.insert(
                            "…".to_string(),
                            Value::String(format!("[{} more keys]", map.len() - i)),
                        );
                        break;
                    }
                    out.insert(self.clip(k), self.value_at(v, depth + 1));
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                if depth >= self.limits.max_depth {
                    return Value::String(TRUNCATED.to_string());
                }
                let mut out = Vec::new();
                for (i, v) in items.iter().enumerate() {
                    if i >= self.limits.max_items {
                        out.push(Value::String(format!("[{} more items]", items.len() - i)));
                        break;
                    }
                    out.push(self.value_at(v, depth + 1));
                }
                Value::Array(out)
            }
            other => other.clone(),
        }
    }

    /// Parse and sanitize a JSON byte body. Returns `None` when the bytes are
    /// not valid JSON.
    pub fn json_bytes(&self, bytes: &[u8]) -> Option<Value> {
        serde_json::from_slice::<Value>(bytes)
            .ok()
            .map(|v| self.value(&v))
    }

    fn clip(&self, s: &str) -> String {
        clip_str(s, self.limits.max_string)
    }
}

fn clip_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}… [{} chars]", &s[..end], s.len())
}

/// Bounded snapshot of any `Debug` value. This is the fallback
/// representation for function arguments and return values, where a
/// structural form is not available.
pub fn debug_value<T: fmt::Debug + ?Sized>(value: &T) -> Value {
    Value::String(clip_str(&format!("{:?}", value), Limits::default().max_string))
}

/// Assemble the argument snapshot array bound by `args_snapshot!`.
pub fn args_array(items: Vec<Value>) -> Value {
    Value::Array(items)
}

/// Canonical representation of an error.
pub fn error_value<E: fmt::Display + ?Sized>(error: &E) -> Value {
    json!({
        "error": clip_str(&error.to_string(), Limits::default().max_string),
    })
}

/// Canonical representation of a byte buffer.
pub fn bytes_value(bytes: &[u8]) -> Value {
    Value::String(format!("[Buffer {} bytes]", bytes.len()))
}

/// Canonical representation of a big integer that does not fit a JSON
/// number.
pub fn big_int_value(digits: &str) -> Value {
    Value::String(format!("{}n", digits))
}

/// Canonical representation of a map.
pub fn map_value<K: fmt::Debug, V: fmt::Debug>(map: &HashMap<K, V>) -> Value {
    let limits = Limits::default();
    let entries: BTreeMap<String, Value> = map
        .iter()
        .take(limits.max_items)
        .map(|(k, v)| (format!("{:?}", k), debug_value(v)))
        .collect();
    json!({ "map": entries, "size": map.len() })
}

/// Canonical representation of a set-like collection.
pub fn set_value<T: fmt::Debug>(items: impl IntoIterator<Item = T>, len: usize) -> Value {
    let limits = Limits::default();
    let items: Vec<Value> = items
        .into_iter()
        .take(limits.max_items)
        .map(|v| debug_value(&v))
        .collect();
    json!({ "set": items, "size": len })
}

/// Placeholder for an unresolved future embedded in a snapshot.
pub fn pending_future_value() -> Value {
    Value::String(PENDING_FUTURE.to_string())
}

/// Per-key placeholder when a value refuses to serialize.
pub fn unserializable(reason: &str) -> Value {
    Value::String(format!("[Cannot serialize: {}]", reason))
}

/// Summary of a deferred query builder: never the builder itself, only its
/// shape.
pub fn query_summary(
    model: &str,
    op: &str,
    filter: Option<&Value>,
    update: Option<&Value>,
    options: Option<&Value>,
) -> Value {
    let sanitizer = Sanitizer::default();
    let mut out = serde_json::Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert("op".to_string(), Value::String(op.to_string()));
    if let Some(filter) = filter {
        out.insert("filter".to_string(), sanitizer.value(filter));
    }
    if let Some(update) = update {
        out.insert("update".to_string(), sanitizer.value(update));
    }
    if let Some(options) = options {
        out.insert("options".to_string(), sanitizer.value(options));
    }
    Value::Object(out)
}
