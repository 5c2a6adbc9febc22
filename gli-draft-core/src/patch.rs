//! Partial draft updates.
//!
//! A patch is a JSON object deep-merged into the serialized draft: objects
//! merge key by key, anything else replaces. The same value travels over the
//! wire as the `data` of a `contract_update` message.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::draft::ContractDraft;
use crate::store::DraftError;

/// Keys a patch may never overwrite.
const PROTECTED_KEYS: &[&str] = &["id", "createdAt"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DraftPatch(Map<String, Value>);

impl DraftPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value at a dotted path, e.g. `"property.address"`.
    pub fn set(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.insert(path, value.into());
        self
    }

    pub fn insert(&mut self, path: &str, value: Value) {
        let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();
        let mut node = &mut self.0;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.insert(segment.to_string(), value);
                return;
            }
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            node = match child {
                Value::Object(map) => map,
                _ => return,
            };
        }
    }

    /// Wrap an arbitrary JSON value; only objects are valid patches.
    pub fn from_value(value: Value) -> Result<Self, DraftError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DraftError::Malformed(format!(
                "patch must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut value = self.0.get(first)?;
        for segment in segments {
            value = value.get(segment)?;
        }
        Some(value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Produce the patched draft without touching `draft`.
    ///
    /// Protected identity keys are skipped. Fails if the merged document no
    /// longer has the shape of a draft.
    pub fn apply_to(&self, draft: &ContractDraft) -> Result<ContractDraft, DraftError> {
        let mut doc = serde_json::to_value(draft)
            .map_err(|e| DraftError::Malformed(e.to_string()))?;
        if let Value::Object(target) = &mut doc {
            for (key, value) in &self.0 {
                if PROTECTED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                merge_value(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        serde_json::from_value(doc).map_err(|e| DraftError::Malformed(e.to_string()))
    }
}

fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_value(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::ContractType;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn draft() -> ContractDraft {
        let now = Utc.timestamp_millis_opt(1_704_067_200_000).unwrap();
        let mut d = ContractDraft::new(ContractType::Sale, "House", now);
        d.property.city = "Madrid".into();
        d
    }

    #[test]
    fn test_dotted_path_builds_nested_object() {
        let patch = DraftPatch::new().set("property.address", "Calle Mayor 1");
        assert_eq!(patch.get("property.address"), Some(&json!("Calle Mayor 1")));
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({ "property": { "address": "Calle Mayor 1" } })
        );
    }

    #[test]
    fn test_apply_merges_without_clobbering_siblings() {
        let d = draft();
        let patched = DraftPatch::new()
            .set("property.address", "Calle Mayor 1")
            .set("title", "Renamed")
            .apply_to(&d)
            .unwrap();
        assert_eq!(patched.property.address, "Calle Mayor 1");
        assert_eq!(patched.property.city, "Madrid");
        assert_eq!(patched.title, "Renamed");
    }

    #[test]
    fn test_protected_keys_ignored() {
        let d = draft();
        let patched = DraftPatch::new()
            .set("id", "00000000-0000-0000-0000-000000000000")
            .set("createdAt", "1999-01-01T00:00:00Z")
            .apply_to(&d)
            .unwrap();
        assert_eq!(patched.id, d.id);
        assert_eq!(patched.created_at, d.created_at);
    }

    #[test]
    fn test_shape_breaking_patch_rejected() {
        let d = draft();
        let result = DraftPatch::new().set("type", "spaceship").apply_to(&d);
        assert!(matches!(result, Err(DraftError::Malformed(_))));
    }

    #[test]
    fn test_custom_fields_accept_arbitrary_json() {
        let d = draft();
        let patched = DraftPatch::new()
            .set("customFields.parking", json!({ "spaces": 2 }))
            .apply_to(&d)
            .unwrap();
        assert_eq!(patched.custom_fields["parking"], json!({ "spaces": 2 }));
    }

    #[test]
    fn test_from_value_requires_object() {
        assert!(DraftPatch::from_value(json!([1, 2])).is_err());
        assert!(DraftPatch::from_value(json!({ "title": "x" })).is_ok());
    }
}
