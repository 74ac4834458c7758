//! Schema-less metadata attached to products and events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Ordered `String -> JSON value` map.
///
/// Only required top-level keys are ever validated; everything else is opaque
/// and carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, JsonValue>);

impl ValueObject for Metadata {}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from a JSON value. Only objects (or `null`) are accepted.
    pub fn from_json(value: JsonValue) -> DomainResult<Self> {
        match value {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(map) => Ok(Self(map.into_iter().collect())),
            other => Err(DomainError::validation(format!(
                "metadata must be a JSON object, got {other}"
            ))),
        }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Option<JsonValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(JsonValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    /// Overlay `other` on top of `self` (keys in `other` win).
    pub fn merged(mut self, other: &Metadata) -> Self {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone().into_iter().collect())
    }
}

impl FromIterator<(String, JsonValue)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_rejects_non_objects() {
        let err = Metadata::from_json(json!([1, 2])).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(Metadata::from_json(JsonValue::Null).unwrap().is_empty());
    }

    #[test]
    fn keys_iterate_in_order_and_serialize_transparently() {
        let meta = Metadata::new().with("b", 2).with("a", 1);
        let keys: Vec<_> = meta.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(serde_json::to_value(&meta).unwrap(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merged_prefers_overlay() {
        let base = Metadata::new().with("k", "old").with("keep", true);
        let merged = base.merged(&Metadata::new().with("k", "new"));
        assert_eq!(merged.get_str("k"), Some("new"));
        assert_eq!(merged.get("keep"), Some(&json!(true)));
    }
}
