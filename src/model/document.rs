use crate::model::{Id, ORGANIZATION_FIELD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single stored document: a stable id plus a flat map of fields.
///
/// Serializes as one flat JSON object with `id` alongside the other fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Id,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<Id>, mut fields: Map<String, Value>) -> Self {
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a document from a JSON object literal. Non-object values yield an empty field map.
    pub fn from_json(id: impl Into<Id>, value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::new(id, fields),
            _ => Self::new(id, Map::new()),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        if field != "id" {
            self.fields.insert(field, value);
        }
    }

    /// A field is absent when the key is missing or holds `null`.
    pub fn is_absent(&self, field: &str) -> bool {
        matches!(self.fields.get(field), None | Some(Value::Null))
    }

    pub fn organization_id(&self) -> Option<&str> {
        self.get_str(ORGANIZATION_FIELD).filter(|org| !org.is_empty())
    }

    /// Merge semantics of a partial update: listed fields replace, others are untouched.
    pub fn merge(&mut self, partial: &Map<String, Value>) {
        for (field, value) in partial {
            self.set(field.clone(), value.clone());
        }
    }

    /// Names of fields violating the flat-only invariant, in field order.
    pub fn nested_fields(&self) -> Vec<String> {
        nested_fields(&self.fields)
    }

    /// Members of an array field as strings; a missing or non-array field reads as empty.
    pub fn string_array(&self, field: &str) -> Vec<String> {
        match self.fields.get(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Fields of `fields` holding a nested mapping (directly or inside an array) that is not a timestamp.
pub fn nested_fields(fields: &Map<String, Value>) -> Vec<String> {
    fields
        .iter()
        .filter(|(_, value)| is_nested(value))
        .map(|(field, _)| field.clone())
        .collect()
}

pub(crate) fn is_nested(value: &Value) -> bool {
    match value {
        Value::Object(_) => !is_timestamp(value),
        Value::Array(items) => items.iter().any(is_nested),
        _ => false,
    }
}

/// Timestamps are stored as `{"seconds": i64, "nanoseconds": u32}` and are the one
/// permitted object shape in a document.
pub fn is_timestamp(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 2
                && map.get("seconds").map_or(false, Value::is_i64)
                && map.get("nanoseconds").map_or(false, Value::is_u64)
        }
        _ => false,
    }
}

pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    serde_json::json!({
        "seconds": at.timestamp(),
        "nanoseconds": at.timestamp_subsec_nanos(),
    })
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    if !is_timestamp(value) {
        return None;
    }
    let seconds = value.get("seconds")?.as_i64()?;
    let nanos = u32::try_from(value.get("nanoseconds")?.as_u64()?).ok()?;
    DateTime::from_timestamp(seconds, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flat_document_has_no_nested_fields() {
        let doc = Document::from_json(
            "concert-1",
            json!({
                "titre": "Festival",
                "lieuId": "lieu-5",
                "artistesIds": ["a-1", "a-2"],
                "updatedAt": timestamp_value(Utc::now()),
            }),
        );
        assert!(doc.nested_fields().is_empty());
    }

    #[test]
    fn test_nested_objects_are_reported() {
        let doc = Document::from_json(
            "concert-1",
            json!({
                "lieu": {"id": "lieu-5", "nom": "Salle"},
                "contacts": [{"id": "c-1"}],
                "adresse": "12 rue",
            }),
        );
        let mut nested = doc.nested_fields();
        nested.sort();
        assert_eq!(nested, vec!["contacts".to_string(), "lieu".to_string()]);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let at = DateTime::from_timestamp(1_700_000_000, 42).unwrap();
        let value = timestamp_value(at);
        assert!(is_timestamp(&value));
        assert_eq!(parse_timestamp(&value), Some(at));
        assert!(!is_timestamp(&json!({"seconds": 1})));
    }

    #[test]
    fn test_id_key_never_stored_as_field() {
        let mut doc = Document::from_json("x", json!({"id": "other", "nom": "A"}));
        doc.set("id", json!("y"));
        assert_eq!(doc.id, "x");
        assert!(doc.get("id").is_none());
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({"id": "x", "nom": "A"})
        );
    }
}
