//! Raw source records, staging records and dead letters
//!
//! Source payloads are classified once at ingestion into [`RawRecord`];
//! everything downstream matches on the variant instead of probing fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Member carrying the resource-type discriminator in typed clinical documents
pub const RESOURCE_TYPE_MEMBER: &str = "resourceType";

/// Classified source record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    /// Flat tabular row, all values stringified
    Row { fields: BTreeMap<String, String> },
    /// Typed clinical document
    Resource { resource_type: String, body: Value },
}

impl RawRecord {
    /// Classify a parsed JSON payload
    ///
    /// Objects with a string `resourceType` become resources; other objects
    /// whose members are all scalars become rows (nulls omitted).
    pub fn classify(value: Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!(
                "payload is not a JSON object (found {})",
                json_kind(&value)
            ));
        };

        if let Some(discriminator) = map.get(RESOURCE_TYPE_MEMBER) {
            let Some(resource_type) = discriminator.as_str() else {
                return Err(format!("'{}' must be a string", RESOURCE_TYPE_MEMBER));
            };
            if resource_type.trim().is_empty() {
                return Err(format!("'{}' is empty", RESOURCE_TYPE_MEMBER));
            }
            return Ok(RawRecord::Resource {
                resource_type: resource_type.trim().to_string(),
                body: Value::Object(map),
            });
        }

        let mut fields = BTreeMap::new();
        for (key, value) in map {
            match scalar_to_string(&value) {
                Some(text) => {
                    fields.insert(key, text);
                }
                None if value.is_null() => {}
                None => {
                    return Err(format!(
                        "field '{}' holds a nested {} in a tabular row",
                        key,
                        json_kind(&value)
                    ))
                }
            }
        }

        if fields.is_empty() {
            return Err("row has no non-null fields".to_string());
        }

        Ok(RawRecord::Row { fields })
    }

    /// Resource-type discriminator, if this is a typed document
    pub fn discriminator(&self) -> Option<&str> {
        match self {
            RawRecord::Row { .. } => None,
            RawRecord::Resource { resource_type, .. } => Some(resource_type),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RawRecord::Row { .. } => "row",
            RawRecord::Resource { .. } => "resource",
        }
    }

    /// Look up a field value
    ///
    /// Rows match the column name exactly, then case-insensitively.
    /// Resources take a dotted path where numeric segments index arrays
    /// (`code.coding.0.code`).
    pub fn field(&self, path: &str) -> Option<String> {
        match self {
            RawRecord::Row { fields } => fields
                .get(path)
                .or_else(|| {
                    fields
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(path))
                        .map(|(_, v)| v)
                })
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            RawRecord::Resource { body, .. } => {
                let mut current = body;
                for segment in path.split('.') {
                    current = match current {
                        Value::Object(map) => map.get(segment)?,
                        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                        _ => return None,
                    };
                }
                scalar_to_string(current).filter(|v| !v.trim().is_empty())
            }
        }
    }

    /// Field names visible to schema heuristics
    pub fn field_names(&self) -> Vec<String> {
        match self {
            RawRecord::Row { fields } => fields.keys().cloned().collect(),
            RawRecord::Resource { body, .. } => body
                .as_object()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Canonical JSON text (keys sorted), stable across runs
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Item yielded by a source connector
#[derive(Debug, Clone)]
pub enum SourceItem {
    /// Parsed JSON payload, not yet classified
    Parsed(Value),
    /// Payload that could not be parsed; routed to the dead-letter store
    Malformed { raw: String, reason: String },
}

impl SourceItem {
    /// Raw text of the item for dead-letter storage
    pub fn raw_text(&self) -> String {
        match self {
            SourceItem::Parsed(value) => value.to_string(),
            SourceItem::Malformed { raw, .. } => raw.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Staged,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagingStatus::Staged => "staged",
        }
    }
}

/// Record accepted into the staging store; immutable once written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: String,
    pub job_id: String,
    pub payload: RawRecord,
    pub ingested_at: DateTime<Utc>,
    pub status: StagingStatus,
}

impl StagingRecord {
    pub fn new(job_id: impl Into<String>, payload: RawRecord) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            payload,
            ingested_at: Utc::now(),
            status: StagingStatus::Staged,
        }
    }
}

/// Record that failed processing, kept for replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: String,
    pub job_id: String,
    pub raw_payload: String,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(job_id: impl Into<String>, raw_payload: String, failure_reason: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            raw_payload,
            failure_reason: failure_reason.into(),
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_type_makes_resource() {
        let record = RawRecord::classify(json!({
            "resourceType": "Condition",
            "code": {"coding": [{"system": "ICD10", "code": "E11.9"}]},
            "subject": {"reference": "Patient/p1"}
        }))
        .unwrap();

        assert_eq!(record.discriminator(), Some("Condition"));
        assert_eq!(record.field("code.coding.0.code").as_deref(), Some("E11.9"));
        assert_eq!(record.field("subject.reference").as_deref(), Some("Patient/p1"));
        assert_eq!(record.field("code.coding.1.code"), None);
    }

    #[test]
    fn test_flat_object_makes_row() {
        let record = RawRecord::classify(json!({
            "patient_id": "p1",
            "age": 42,
            "smoker": false,
            "notes": null
        }))
        .unwrap();

        assert_eq!(record.kind(), "row");
        assert_eq!(record.field("age").as_deref(), Some("42"));
        assert_eq!(record.field("SMOKER").as_deref(), Some("false"));
        assert_eq!(record.field("notes"), None);
        assert_eq!(record.field_names(), vec!["age", "patient_id", "smoker"]);
    }

    #[test]
    fn test_nested_row_value_rejected() {
        let err = RawRecord::classify(json!({"a": {"b": 1}})).unwrap_err();
        assert!(err.contains("nested object"));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(RawRecord::classify(json!([1, 2])).is_err());
        assert!(RawRecord::classify(json!("text")).is_err());
        assert!(RawRecord::classify(json!({"resourceType": 5})).is_err());
    }

    #[test]
    fn test_canonical_json_is_key_ordered() {
        let a = RawRecord::classify(json!({"b": "2", "a": "1"})).unwrap();
        let b = RawRecord::classify(json!({"a": "1", "b": "2"})).unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
    }
}
