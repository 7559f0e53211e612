//! Open key/value configuration passed to devices, allocations and kernel builds.
//!
//! Keys are slash-separated paths into a JSON object (`kernel/compiler` addresses
//! `{"kernel": {"compiler": ...}}`). Keys the runtime does not recognize are carried through
//! to backends untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OffloadError, OffloadResult};
use crate::hashing::ContentHash;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(Map<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> OffloadResult<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| OffloadError::json("properties", err))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> OffloadResult<Self> {
        match value {
            Value::Object(map) => Ok(Properties(map)),
            Value::Null => Ok(Properties::new()),
            other => Err(OffloadError::configuration(format!(
                "properties must be a JSON object, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set(path, value);
        self
    }

    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        let mut parts = path.split('/').filter(|part| !part.is_empty()).peekable();
        let mut map = &mut self.0;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                map.insert(part.to_string(), value.into());
                return;
            }
            let entry = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            map = match entry {
                Value::Object(inner) => inner,
                _ => return,
            };
        }
    }

    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let (parent, leaf) = match path.rsplit_once('/') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, path),
        };
        let map = match parent {
            Some(parent) => match self.get_mut(parent)? {
                Value::Object(map) => map,
                _ => return None,
            },
            None => &mut self.0,
        };
        map.remove(leaf)
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('/').filter(|part| !part.is_empty());
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('/').filter(|part| !part.is_empty());
        let mut current = self.0.get_mut(parts.next()?)?;
        for part in parts {
            current = current.as_object_mut()?.get_mut(part)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Booleans are accepted as JSON booleans, numbers (non-zero) or strings ("true", "1", ...).
    pub fn get_bool(&self, path: &str) -> Option<bool> {
        match self.get(path)? {
            Value::Bool(value) => Some(*value),
            Value::Number(number) => number.as_i64().map(|value| value != 0),
            Value::String(text) => Some(crate::env::parse_bool(text)),
            _ => None,
        }
    }

    pub fn get_bool_or(&self, path: &str, default: bool) -> bool {
        self.get_bool(path).unwrap_or(default)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        match self.get(path)? {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns a copy of `self` with `other` merged on top; nested objects merge recursively.
    pub fn merged(&self, other: &Properties) -> Properties {
        let mut out = self.0.clone();
        merge_into(&mut out, &other.0);
        Properties(out)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Stable hash over the canonical (key-sorted) JSON rendering.
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::of_str(&Value::Object(self.0.clone()).to_string())
    }
}

fn merge_into(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming)
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

impl From<Map<String, Value>> for Properties {
    fn from(map: Map<String, Value>) -> Self {
        Properties(map)
    }
}
