//! Standardized (CDM) tables, rows, predictions and persistence summaries

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target tables of the standardized model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdmTable {
    Person,
    VisitOccurrence,
    ConditionOccurrence,
    DrugExposure,
    ProcedureOccurrence,
    Measurement,
    Observation,
}

impl CdmTable {
    /// Tie-break order, most domain-specific first
    pub const PRIORITY: [CdmTable; 7] = [
        CdmTable::ConditionOccurrence,
        CdmTable::Measurement,
        CdmTable::DrugExposure,
        CdmTable::ProcedureOccurrence,
        CdmTable::Observation,
        CdmTable::VisitOccurrence,
        CdmTable::Person,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CdmTable::Person => "PERSON",
            CdmTable::VisitOccurrence => "VISIT_OCCURRENCE",
            CdmTable::ConditionOccurrence => "CONDITION_OCCURRENCE",
            CdmTable::DrugExposure => "DRUG_EXPOSURE",
            CdmTable::ProcedureOccurrence => "PROCEDURE_OCCURRENCE",
            CdmTable::Measurement => "MEASUREMENT",
            CdmTable::Observation => "OBSERVATION",
        }
    }

    /// Vocabulary domain of the table's primary concept column
    pub fn concept_domain(&self) -> &'static str {
        match self {
            CdmTable::Person => "Gender",
            CdmTable::VisitOccurrence => "Visit",
            CdmTable::ConditionOccurrence => "Condition",
            CdmTable::DrugExposure => "Drug",
            CdmTable::ProcedureOccurrence => "Procedure",
            CdmTable::Measurement => "Measurement",
            CdmTable::Observation => "Observation",
        }
    }

    /// Position in [`CdmTable::PRIORITY`] (lower wins ties)
    pub fn priority_rank(&self) -> usize {
        Self::PRIORITY
            .iter()
            .position(|t| t == self)
            .unwrap_or(Self::PRIORITY.len())
    }
}

impl fmt::Display for CdmTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CdmTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        CdmTable::PRIORITY
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| format!("unknown standardized table '{}'", s))
    }
}

/// Ranked alternative of a table prediction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAlternative {
    pub table: CdmTable,
    pub confidence: f32,
    pub score: u32,
}

/// How a prediction was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionTier {
    Discriminator,
    Heuristic,
}

/// Table predictor output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePrediction {
    pub job_id: String,
    pub table: CdmTable,
    pub confidence: f32,
    pub alternatives: Vec<TableAlternative>,
    pub rationale: String,
    pub tier: PredictionTier,
}

/// Store that satisfied the record-source lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordSource {
    /// Staging store filtered by the requested job id
    Staging,
    /// Staging store filtered by the execution job aliased to the requested id
    StagingViaAlias { execution_job_id: String },
    /// Resource-type-specific store filtered by the requested job id
    ResourceStores { stores: Vec<String> },
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::Staging => f.write_str("staging_records"),
            RecordSource::StagingViaAlias { execution_job_id } => {
                write!(f, "staging_records (alias → {})", execution_job_id)
            }
            RecordSource::ResourceStores { stores } => f.write_str(&stores.join(", ")),
        }
    }
}

/// One materialized standardized row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardizedRow {
    pub table: CdmTable,
    /// Stable source-derived identity used for upsert
    pub natural_key: String,
    /// Surrogate key of the row itself
    pub row_id: i64,
    pub person_id: i64,
    pub visit_occurrence_id: Option<i64>,
    pub concept_id: i64,
    pub field_path: Option<String>,
    pub source_value: Option<String>,
    pub row_fields: serde_json::Map<String, serde_json::Value>,
    /// Id of the staging or resource-store document the row came from
    pub source_record_ref: String,
}

/// Result of one persistence run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceSummary {
    pub job_id: String,
    pub table: CdmTable,
    pub inserted: u64,
    pub updated_or_skipped: u64,
    pub total_records_found: u64,
    pub rows_generated: u64,
    /// Rows written with the placeholder concept
    pub unresolved_rows: u64,
    pub source_used: RecordSource,
    pub stores_checked: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_parse_case_insensitive() {
        assert_eq!(
            "condition_occurrence".parse::<CdmTable>().unwrap(),
            CdmTable::ConditionOccurrence
        );
        assert!("NOTE".parse::<CdmTable>().is_err());
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(CdmTable::ConditionOccurrence.priority_rank() < CdmTable::Person.priority_rank());
        assert_eq!(CdmTable::Person.priority_rank(), 6);
    }

    #[test]
    fn test_record_source_display() {
        let source = RecordSource::StagingViaAlias {
            execution_job_id: "exec-1".to_string(),
        };
        assert_eq!(source.to_string(), "staging_records (alias → exec-1)");
    }
}
