//! Property-tree style configuration.
//!
//! [`ValueStore`] wraps a JSON document and exposes slash-separated child
//! lookups (`"estimator/optimizer"`) plus typed getters with defaults, so that
//! components can read their tuning once at construction.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{CalibError, CalibResult};

/// A read-only hierarchical key/value configuration source.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueStore {
    root: Value,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self::empty()
    }
}

impl ValueStore {
    /// A store with no keys; every getter falls back to its default.
    pub fn empty() -> Self {
        Self {
            root: Value::Object(Default::default()),
        }
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_json_str(json: &str) -> CalibResult<Self> {
        Ok(Self::from_value(serde_json::from_str(json)?))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> CalibResult<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            CalibError::Io(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&text)
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(&self.root, |node, segment| node.get(segment))
    }

    pub fn has_key(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    /// Child subtree at `path`. A missing child yields an empty store.
    pub fn child(&self, path: &str) -> ValueStore {
        self.lookup(path)
            .cloned()
            .map(Self::from_value)
            .unwrap_or_default()
    }

    pub fn get_f64(&self, path: &str, default: f64) -> f64 {
        self.lookup(path).and_then(Value::as_f64).unwrap_or(default)
    }

    pub fn get_usize(&self, path: &str, default: usize) -> usize {
        self.lookup(path)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        self.lookup(path).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_string(&self, path: &str, default: &str) -> String {
        self.lookup(path)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    /// Typed lookup that fails when the key is missing or has the wrong type.
    pub fn require<T: DeserializeOwned>(&self, path: &str) -> CalibResult<T> {
        let value = self
            .lookup(path)
            .ok_or_else(|| CalibError::Configuration(format!("missing key '{path}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| CalibError::Configuration(format!("key '{path}': {e}")))
    }

    /// Deserialize the whole subtree into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> CalibResult<T> {
        Ok(serde_json::from_value(self.root.clone())?)
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }
}
