//! Target-table prediction
//!
//! Tier 1 uses resource-type discriminators of staged records (ground truth).
//! Tier 2 scores field names against weighted keyword indicators.

use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};

use crate::db;
use crate::error::PipelineResult;
use crate::models::{CdmTable, PredictionTier, TableAlternative, TablePrediction};

/// Confidence of a discriminator-based prediction
pub const DISCRIMINATOR_CONFIDENCE: f32 = 0.98;

/// Indicator weights for the heuristic tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorWeights {
    pub primary: u32,
    pub secondary: u32,
    pub generic: u32,
}

impl Default for PredictorWeights {
    fn default() -> Self {
        Self {
            primary: 5,
            secondary: 2,
            generic: 1,
        }
    }
}

impl From<&cdm_common::config::PredictorSection> for PredictorWeights {
    fn from(section: &cdm_common::config::PredictorSection) -> Self {
        Self {
            primary: section.primary_weight,
            secondary: section.secondary_weight,
            generic: section.generic_weight,
        }
    }
}

struct Indicators {
    table: CdmTable,
    primary: &'static [&'static str],
    secondary: &'static [&'static str],
    generic: &'static [&'static str],
}

const INDICATORS: &[Indicators] = &[
    Indicators {
        table: CdmTable::Person,
        primary: &["gender", "sex", "birth_date", "date_of_birth", "dob", "year_of_birth"],
        secondary: &["race", "ethnicity", "deceased"],
        generic: &["patient_id", "person_id", "age", "zip"],
    },
    Indicators {
        table: CdmTable::VisitOccurrence,
        primary: &["visit", "encounter_type", "admission", "discharge"],
        secondary: &["admit_date", "facility", "care_site", "length_of_stay"],
        generic: &["patient_id", "encounter_id"],
    },
    Indicators {
        table: CdmTable::ConditionOccurrence,
        primary: &["diagnosis", "condition", "icd", "icd10", "icd_code"],
        secondary: &["onset", "problem", "severity"],
        generic: &["patient_id", "encounter_id"],
    },
    Indicators {
        table: CdmTable::DrugExposure,
        primary: &["drug", "medication", "rxnorm", "ndc"],
        secondary: &["dose", "route", "quantity", "days_supply", "refills"],
        generic: &["patient_id"],
    },
    Indicators {
        table: CdmTable::ProcedureOccurrence,
        primary: &["procedure", "cpt", "hcpcs"],
        secondary: &["surgeon", "modifier", "anesthesia"],
        generic: &["patient_id", "encounter_id"],
    },
    Indicators {
        table: CdmTable::Measurement,
        primary: &["lab", "loinc", "measurement", "result_value", "test_name"],
        secondary: &["unit", "units", "reference_range", "specimen", "abnormal_flag"],
        generic: &["patient_id"],
    },
    Indicators {
        table: CdmTable::Observation,
        primary: &["observation", "allergy", "allergen", "smoking"],
        secondary: &["finding", "survey", "reaction"],
        generic: &["patient_id"],
    },
];

/// Standardized table for a resource-type discriminator
///
/// Case-insensitive; a trailing `Record` or `Resource` is ignored.
pub fn discriminator_table(discriminator: &str) -> Option<CdmTable> {
    let lower = discriminator.trim().to_ascii_lowercase();
    let base = lower
        .strip_suffix("record")
        .or_else(|| lower.strip_suffix("resource"))
        .unwrap_or(&lower);

    match base {
        "patient" => Some(CdmTable::Person),
        "encounter" => Some(CdmTable::VisitOccurrence),
        "condition" => Some(CdmTable::ConditionOccurrence),
        "observation" => Some(CdmTable::Measurement),
        "medicationrequest" | "medicationstatement" | "medicationadministration"
        | "immunization" => Some(CdmTable::DrugExposure),
        "procedure" => Some(CdmTable::ProcedureOccurrence),
        "allergyintolerance" => Some(CdmTable::Observation),
        _ => None,
    }
}

/// Lowercase snake form of a field name (`birthDate` → `birth_date`)
fn normalize_field(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else {
            out.push('_');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
    }
    out
}

/// An indicator matches a field when it appears as a whole `_`-bounded token run
fn indicator_matches(fields: &[String], indicator: &str) -> bool {
    let needle = format!("_{}_", indicator);
    fields.iter().any(|f| format!("_{}_", f).contains(&needle))
}

/// Heuristic prediction over field names
pub fn predict_from_fields(
    job_id: &str,
    field_names: &[String],
    weights: &PredictorWeights,
) -> TablePrediction {
    let fields: Vec<String> = field_names.iter().map(|f| normalize_field(f)).collect();

    let mut scored: Vec<(CdmTable, u32, f32, Vec<&'static str>)> = INDICATORS
        .iter()
        .map(|ind| {
            let groups = [
                (ind.primary, weights.primary),
                (ind.secondary, weights.secondary),
                (ind.generic, weights.generic),
            ];
            let mut score = 0;
            let mut max = 0;
            let mut matched = Vec::new();
            for (words, weight) in groups {
                for word in words {
                    max += weight;
                    if indicator_matches(&fields, word) {
                        score += weight;
                        matched.push(*word);
                    }
                }
            }
            let confidence = if max == 0 { 0.0 } else { score as f32 / max as f32 };
            (ind.table, score, confidence, matched)
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.priority_rank().cmp(&b.0.priority_rank())));

    let (table, score, confidence, matched) = scored.remove(0);
    if score == 0 {
        return TablePrediction {
            job_id: job_id.to_string(),
            table: CdmTable::Observation,
            confidence: 0.0,
            alternatives: Vec::new(),
            rationale: format!("No table indicator matched fields [{}]", field_names.join(", ")),
            tier: PredictionTier::Heuristic,
        };
    }

    let alternatives = scored
        .into_iter()
        .filter(|(_, score, _, _)| *score > 0)
        .map(|(table, score, confidence, _)| TableAlternative { table, confidence, score })
        .collect();

    TablePrediction {
        job_id: job_id.to_string(),
        table,
        confidence,
        alternatives,
        rationale: format!(
            "Field names matched {} indicators [{}] (score {})",
            table,
            matched.join(", "),
            score
        ),
        tier: PredictionTier::Heuristic,
    }
}

/// Discriminator prediction from per-discriminator record counts
///
/// `None` when no discriminator maps to a table.
pub fn predict_from_discriminators(
    job_id: &str,
    counts: &BTreeMap<String, u64>,
) -> Option<TablePrediction> {
    let mut per_table: BTreeMap<CdmTable, (u64, BTreeSet<&str>)> = BTreeMap::new();
    for (discriminator, count) in counts {
        if let Some(table) = discriminator_table(discriminator) {
            let entry = per_table.entry(table).or_default();
            entry.0 += count;
            entry.1.insert(discriminator.as_str());
        }
    }

    let total: u64 = per_table.values().map(|(n, _)| n).sum();
    let mut ranked: Vec<(CdmTable, u64, BTreeSet<&str>)> =
        per_table.into_iter().map(|(t, (n, d))| (t, n, d)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.priority_rank().cmp(&b.0.priority_rank())));

    if ranked.is_empty() {
        return None;
    }
    let (table, count, discriminators) = ranked.remove(0);

    let alternatives = ranked
        .into_iter()
        .map(|(table, n, _)| TableAlternative {
            table,
            confidence: DISCRIMINATOR_CONFIDENCE * n as f32 / total as f32,
            score: n as u32,
        })
        .collect();

    Some(TablePrediction {
        job_id: job_id.to_string(),
        table,
        confidence: DISCRIMINATOR_CONFIDENCE,
        alternatives,
        rationale: format!(
            "Resource type {} on {} of {} staged records",
            discriminators.into_iter().collect::<Vec<_>>().join("/"),
            count,
            total
        ),
        tier: PredictionTier::Discriminator,
    })
}

/// Table predictor bound to the staging store
#[derive(Clone)]
pub struct TablePredictor {
    db: SqlitePool,
    weights: PredictorWeights,
}

impl TablePredictor {
    pub fn new(db: SqlitePool, weights: PredictorWeights) -> Self {
        Self { db, weights }
    }

    pub fn weights(&self) -> &PredictorWeights {
        &self.weights
    }

    /// Predict the table of a job's records
    ///
    /// `field_schema` defaults to the field names of the job's staged rows.
    pub async fn predict(
        &self,
        job_id: &str,
        field_schema: Option<Vec<String>>,
    ) -> PipelineResult<TablePrediction> {
        let counts = db::staging::discriminator_counts(&self.db, job_id).await?;
        if let Some(prediction) = predict_from_discriminators(job_id, &counts) {
            tracing::debug!(job_id = %job_id, table = %prediction.table, "Predicted from discriminator");
            return Ok(prediction);
        }

        let fields = match field_schema {
            Some(fields) => fields,
            None => db::staging::field_schema(&self.db, job_id).await?,
        };

        let prediction = predict_from_fields(job_id, &fields, &self.weights);
        tracing::debug!(
            job_id = %job_id,
            table = %prediction.table,
            confidence = prediction.confidence,
            "Predicted from field heuristics"
        );
        Ok(prediction)
    }
}
