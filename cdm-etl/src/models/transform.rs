//! Per-job field transformation
//!
//! Applied to every classified record before the staging write. A record that
//! cannot be transformed is a record-level failure, never a job failure.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::RawRecord;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    /// Source column → target column (rows only)
    #[serde(default)]
    pub rename: BTreeMap<String, String>,

    /// Columns removed before staging (rows only)
    #[serde(default)]
    pub drop: Vec<String>,

    /// Fields that must be present after renaming (dotted paths for resources)
    #[serde(default)]
    pub required: Vec<String>,

    /// Trim surrounding whitespace from row values
    #[serde(default)]
    pub trim_values: bool,

    /// Only accept resources of this type
    #[serde(default)]
    pub expected_resource_type: Option<String>,
}

impl FieldTransform {
    /// Check the configuration itself
    ///
    /// Errors here are fatal configuration errors for the job.
    pub fn validate(&self) -> Result<(), String> {
        for (from, to) in &self.rename {
            if from.trim().is_empty() || to.trim().is_empty() {
                return Err(format!("rename '{}' → '{}' has an empty column name", from, to));
            }
            if self.drop.iter().any(|d| d == from) {
                return Err(format!("column '{}' is both renamed and dropped", from));
            }
        }

        let mut targets = BTreeSet::new();
        for to in self.rename.values() {
            if !targets.insert(to) {
                return Err(format!("several columns are renamed to '{}'", to));
            }
        }

        let mut seen = BTreeSet::new();
        for field in &self.required {
            if field.trim().is_empty() {
                return Err("required field name is empty".to_string());
            }
            if !seen.insert(field) {
                return Err(format!("required field '{}' listed twice", field));
            }
        }

        Ok(())
    }

    /// Apply the transformation to one record
    pub fn apply(&self, record: RawRecord) -> Result<RawRecord, String> {
        let record = match record {
            RawRecord::Row { fields } => {
                let mut out = BTreeMap::new();
                for (key, value) in fields {
                    if self.drop.iter().any(|d| d == &key) {
                        continue;
                    }
                    let key = self.rename.get(&key).cloned().unwrap_or(key);
                    let value = if self.trim_values {
                        value.trim().to_string()
                    } else {
                        value
                    };
                    out.insert(key, value);
                }
                RawRecord::Row { fields: out }
            }
            RawRecord::Resource { resource_type, body } => {
                if let Some(expected) = &self.expected_resource_type {
                    if !expected.eq_ignore_ascii_case(&resource_type) {
                        return Err(format!(
                            "resource type '{}' does not match expected '{}'",
                            resource_type, expected
                        ));
                    }
                }
                RawRecord::Resource { resource_type, body }
            }
        };

        for field in &self.required {
            if record.field(field).is_none() {
                return Err(format!("missing required field '{}'", field));
            }
        }

        Ok(record)
    }
}
