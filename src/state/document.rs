//! The global state document and slice merging.

use crate::error::{Result, SwitchboardError};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const USER_SLICE: &str = "user";
pub const THEME_SLICE: &str = "theme";
pub const LOCALE_SLICE: &str = "locale";
pub const APPS_SLICE: &str = "apps";

/// The shared document, partitioned into disjoint named slices.
///
/// Slices are reference-counted: a commit that does not address a slice
/// carries the previous `Arc` over unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDocument {
    slices: BTreeMap<String, Arc<Value>>,
}

impl StateDocument {
    /// Empty document with no slices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Document with the identity, presentation, locale and fragment-registry
    /// slices.
    pub fn standard() -> Self {
        Self::new()
            .with_slice(USER_SLICE, json!({ "current": null, "authenticated": false }))
            .with_slice(THEME_SLICE, json!({ "current": "light" }))
            .with_slice(LOCALE_SLICE, json!({ "current": "en" }))
            .with_slice(APPS_SLICE, json!({ "registered": {} }))
    }

    /// Add or replace a slice (builder style).
    pub fn with_slice(mut self, name: impl Into<String>, value: Value) -> Self {
        self.slices.insert(name.into(), Arc::new(value));
        self
    }

    /// Get a slice.
    pub fn slice(&self, name: &str) -> Option<&Arc<Value>> {
        self.slices.get(name)
    }

    /// Whether the slice exists.
    pub fn has_slice(&self, name: &str) -> bool {
        self.slices.contains_key(name)
    }

    /// Slice names in order.
    pub fn slice_names(&self) -> impl Iterator<Item = &str> {
        self.slices.keys().map(String::as_str)
    }

    /// Number of slices.
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Look up a value by slash-separated path, e.g. `theme/current`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let slice = self.slices.get(parts.next()?)?;
        parts.try_fold(slice.as_ref(), |value, key| match value {
            Value::Object(map) => map.get(key),
            Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// Apply per-slice patches, producing a new document.
    ///
    /// Only the patched slices are rebuilt; every other slice keeps its `Arc`.
    /// A patch to a missing slice creates it.
    pub fn apply_patches(&self, patches: &Map<String, Value>) -> StateDocument {
        let mut slices = self.slices.clone();
        for (name, patch) in patches {
            let merged = match slices.get(name) {
                Some(current) => merge_patch(current, patch),
                None => merge_patch(&Value::Null, patch),
            };
            slices.insert(name.clone(), Arc::new(merged));
        }
        StateDocument { slices }
    }

    /// Keep only the named slices.
    pub fn filtered<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> StateDocument {
        let mut slices = BTreeMap::new();
        for name in names {
            if let Some(value) = self.slices.get(name) {
                slices.insert(name.to_string(), Arc::clone(value));
            }
        }
        StateDocument { slices }
    }

    /// The whole document as one JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.slices
                .iter()
                .map(|(k, v)| (k.clone(), Value::clone(v)))
                .collect(),
        )
    }

    /// Build a document from a JSON object keyed by slice name.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(StateDocument {
                slices: map.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
            }),
            other => Err(SwitchboardError::Deserialization(format!(
                "State document must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }
}

impl Serialize for StateDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(self.slices.iter().map(|(k, v)| (k, &**v)))
    }
}

impl<'de> Deserialize<'de> for StateDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let slices = BTreeMap::<String, Value>::deserialize(deserializer)?;
        Ok(StateDocument {
            slices: slices.into_iter().map(|(k, v)| (k, Arc::new(v))).collect(),
        })
    }
}

/// Apply a JSON Merge Patch (RFC 7386) to a value.
///
/// Objects merge recursively, `null` removes a key, anything else replaces.
pub fn merge_patch(target: &Value, patch: &Value) -> Value {
    match patch {
        Value::Object(patch_map) => {
            let mut merged = match target {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            for (key, value) in patch_map {
                if value.is_null() {
                    merged.remove(key);
                } else {
                    let current = merged.get(key).cloned().unwrap_or(Value::Null);
                    merged.insert(key.clone(), merge_patch(&current, value));
                }
            }
            Value::Object(merged)
        }
        other => other.clone(),
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
