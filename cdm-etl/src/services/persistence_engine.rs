//! Persistence engine
//!
//! Materializes standardized rows for every staged record of a job. Records
//! are located by an ordered lookup (staging, staging through a job alias,
//! resource stores) that stops at the first non-empty store and never reads
//! another job's records. Rows are keyed by a natural key derived from the
//! source, so re-running persistence updates rows instead of duplicating them.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use cdm_common::events::{EventBus, PipelineEvent};
use cdm_common::identity::{content_hash, surrogate_key};

use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    CdmTable, MappingKey, PersistenceSummary, RecordSource, StagingRecord, StandardizedRow,
    UNRESOLVED_CONCEPT_ID,
};
use crate::services::concept_normalizer::{ConceptNormalizer, NormalizationConfig};
use crate::services::table_predictor::{predict_from_discriminators, predict_from_fields, PredictorWeights};
use crate::services::table_rules::{self, rule_for, CodedField};

/// Name of the staging store in diagnostics
pub const STAGING_STORE: &str = "staging_records";

/// Name of the alias lookup in diagnostics
pub const ALIAS_STORE: &str = "job_aliases";

/// Persistence request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistRequest {
    /// Target table; predicted from the records when absent
    #[serde(default)]
    pub table: Option<CdmTable>,
}

/// Records located for a job
#[derive(Debug, Clone)]
pub struct ResolvedRecords {
    pub records: Vec<StagingRecord>,
    pub source: RecordSource,
    pub stores_checked: Vec<String>,
}

/// Ordered record-source lookup
///
/// Each step runs only if the previous one found nothing. Fails with
/// [`PipelineError::NoRecordsFound`] naming every store checked.
pub async fn resolve_records(pool: &SqlitePool, job_id: &str) -> PipelineResult<ResolvedRecords> {
    let mut stores_checked = vec![STAGING_STORE.to_string()];

    let records = db::staging::find_by_job(pool, job_id).await?;
    if !records.is_empty() {
        return Ok(ResolvedRecords {
            records,
            source: RecordSource::Staging,
            stores_checked,
        });
    }

    stores_checked.push(ALIAS_STORE.to_string());
    if let Some(execution_job_id) = db::aliases::resolve_alias(pool, job_id).await? {
        let records = db::staging::find_by_job(pool, &execution_job_id).await?;
        if !records.is_empty() {
            tracing::info!(
                job_id = %job_id,
                execution_job_id = %execution_job_id,
                "Records found through job alias"
            );
            return Ok(ResolvedRecords {
                records,
                source: RecordSource::StagingViaAlias { execution_job_id },
                stores_checked,
            });
        }
    }

    let mut records = Vec::new();
    let mut stores = Vec::new();
    for store in db::resource_stores::store_names() {
        let found = db::resource_stores::find_by_job(pool, &store, job_id).await?;
        if !found.is_empty() {
            stores.push(store.clone());
            records.extend(found);
        }
        stores_checked.push(store);
    }
    if !records.is_empty() {
        return Ok(ResolvedRecords {
            records,
            source: RecordSource::ResourceStores { stores },
            stores_checked,
        });
    }

    tracing::warn!(job_id = %job_id, stores = ?stores_checked, "No records found for persistence");
    Err(PipelineError::NoRecordsFound {
        job_id: job_id.to_string(),
        stores_checked,
    })
}

/// Identity parts of one record
struct RecordIdentity {
    patient_key: String,
    /// Hash of the canonical payload; keeps same-day events apart
    record_hash: String,
    encounter: Option<String>,
    person_id: i64,
    visit_occurrence_id: Option<i64>,
}

fn record_identity(record: &StagingRecord) -> RecordIdentity {
    let record_hash = content_hash(record.payload.canonical_json().as_bytes());
    let patient_key = match table_rules::patient_id(&record.payload) {
        Some(id) => id,
        None => format!("sha256:{}", record_hash),
    };
    let encounter = table_rules::encounter_id(&record.payload);
    let person_id = surrogate_key("person", &[&patient_key]);
    let visit_occurrence_id = encounter
        .as_deref()
        .map(|e| surrogate_key("visit_occurrence", &[&patient_key, e]));

    RecordIdentity {
        patient_key,
        record_hash,
        encounter,
        person_id,
        visit_occurrence_id,
    }
}

/// Natural key `table|patient|encounter|field|code|date|record`
///
/// `record` is the payload hash, so two events that agree on every other
/// part (same-day measurements with different values) stay distinct while
/// a rerun over the same staging record maps onto the same row.
pub fn natural_key(
    table: CdmTable,
    patient: &str,
    encounter: Option<&str>,
    field_path: Option<&str>,
    code: Option<&str>,
    date: Option<&str>,
    record: &str,
) -> String {
    [
        table.as_str(),
        patient,
        encounter.unwrap_or(""),
        field_path.unwrap_or(""),
        code.unwrap_or(""),
        date.unwrap_or(""),
        record,
    ]
    .join("|")
}

#[derive(Clone)]
pub struct PersistenceEngine {
    db: SqlitePool,
    event_bus: EventBus,
    normalizer: ConceptNormalizer,
    normalization: NormalizationConfig,
    weights: PredictorWeights,
}

impl PersistenceEngine {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        normalizer: ConceptNormalizer,
        normalization: NormalizationConfig,
        weights: PredictorWeights,
    ) -> Self {
        Self {
            db,
            event_bus,
            normalizer,
            normalization,
            weights,
        }
    }

    /// Materialize and upsert the rows of a job
    pub async fn persist(&self, job_id: &str, request: &PersistRequest) -> PipelineResult<PersistenceSummary> {
        if job_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("job id is empty".to_string()));
        }

        let resolved = resolve_records(&self.db, job_id).await?;
        let table = match request.table {
            Some(table) => table,
            None => self.predict_table(job_id, &resolved.records),
        };

        let rows = self.build_rows(job_id, table, &resolved).await?;
        let unresolved_rows = rows
            .iter()
            .filter(|r| r.concept_id == UNRESOLVED_CONCEPT_ID)
            .count() as u64;

        let counts = db::cdm_rows::upsert_rows(&self.db, job_id, &rows).await?;

        let summary = PersistenceSummary {
            job_id: job_id.to_string(),
            table,
            inserted: counts.inserted,
            updated_or_skipped: counts.updated + counts.skipped,
            total_records_found: resolved.records.len() as u64,
            rows_generated: rows.len() as u64,
            unresolved_rows,
            source_used: resolved.source,
            stores_checked: resolved.stores_checked,
        };

        tracing::info!(
            job_id = %job_id,
            table = %table,
            records = summary.total_records_found,
            inserted = summary.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            unresolved = unresolved_rows,
            source = %summary.source_used,
            "Persistence finished"
        );

        self.event_bus.emit_lossy(PipelineEvent::PersistenceCompleted {
            job_id: job_id.to_string(),
            table: table.as_str().to_string(),
            inserted: summary.inserted,
            updated_or_skipped: summary.updated_or_skipped,
            total_records_found: summary.total_records_found,
            source_used: summary.source_used.to_string(),
            timestamp: chrono::Utc::now(),
        });

        Ok(summary)
    }

    /// Table of the located records: discriminators first, field names otherwise
    fn predict_table(&self, job_id: &str, records: &[StagingRecord]) -> CdmTable {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut fields = BTreeSet::new();
        for record in records {
            match record.payload.discriminator() {
                Some(d) => *counts.entry(d.to_string()).or_default() += 1,
                None => fields.extend(record.payload.field_names()),
            }
        }

        let prediction = predict_from_discriminators(job_id, &counts).unwrap_or_else(|| {
            let fields: Vec<String> = fields.into_iter().collect();
            predict_from_fields(job_id, &fields, &self.weights)
        });
        tracing::debug!(
            job_id = %job_id,
            table = %prediction.table,
            confidence = prediction.confidence,
            "Target table predicted"
        );
        prediction.table
    }

    async fn build_rows(
        &self,
        job_id: &str,
        table: CdmTable,
        resolved: &ResolvedRecords,
    ) -> PipelineResult<Vec<StandardizedRow>> {
        let rule = rule_for(table);
        let mapping_job = match &resolved.source {
            RecordSource::StagingViaAlias { execution_job_id } => Some(execution_job_id.as_str()),
            _ => None,
        };
        let mut concepts: HashMap<(String, String), i64> = HashMap::new();
        let mut rows = Vec::new();

        for record in &resolved.records {
            let identity = record_identity(record);
            let date = rule.event_date(&record.payload);

            let mut row_fields = serde_json::Map::new();
            if let Some(date) = &date {
                row_fields.insert(rule.date_column.to_string(), date.clone().into());
            }
            if let Some(value) = rule.value(&record.payload) {
                row_fields.insert("value_source_value".to_string(), value.into());
            }
            if let Some(unit) = table_rules::unit(&record.payload) {
                row_fields.insert("unit_source_value".to_string(), unit.into());
            }

            let facts = rule.coded_facts(&record.payload);
            if facts.is_empty() {
                // Records without a coded field still produce a row
                rows.push(self.row(
                    table,
                    record,
                    &identity,
                    None,
                    UNRESOLVED_CONCEPT_ID,
                    date.as_deref(),
                    row_fields,
                ));
                continue;
            }

            for codings in facts {
                // First coding that resolves wins; otherwise the first coding
                let mut chosen: Option<(&CodedField, i64)> = None;
                for field in &codings {
                    let cache_key = (field.field_path.clone(), field.code.clone());
                    let concept_id = match concepts.get(&cache_key) {
                        Some(id) => *id,
                        None => {
                            let id = self.concept_for(job_id, mapping_job, table, field).await?;
                            concepts.insert(cache_key, id);
                            id
                        }
                    };
                    if concept_id != UNRESOLVED_CONCEPT_ID {
                        chosen = Some((field, concept_id));
                        break;
                    }
                }
                let (field, concept_id) = match (chosen, codings.first()) {
                    (Some(found), _) => found,
                    (None, Some(first)) => (first, UNRESOLVED_CONCEPT_ID),
                    (None, None) => continue,
                };
                rows.push(self.row(
                    table,
                    record,
                    &identity,
                    Some(field),
                    concept_id,
                    date.as_deref(),
                    row_fields.clone(),
                ));
            }
        }

        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    fn row(
        &self,
        table: CdmTable,
        record: &StagingRecord,
        identity: &RecordIdentity,
        field: Option<&CodedField>,
        concept_id: i64,
        date: Option<&str>,
        row_fields: serde_json::Map<String, serde_json::Value>,
    ) -> StandardizedRow {
        let natural_key = natural_key(
            table,
            &identity.patient_key,
            identity.encounter.as_deref(),
            field.map(|f| f.field_path.as_str()),
            field.map(|f| f.code.as_str()),
            date,
            &identity.record_hash,
        );
        StandardizedRow {
            table,
            row_id: surrogate_key(table.as_str(), &[&natural_key]),
            natural_key,
            person_id: identity.person_id,
            visit_occurrence_id: identity.visit_occurrence_id,
            concept_id,
            field_path: field.map(|f| f.field_path.clone()),
            source_value: field.map(|f| f.code.clone()),
            row_fields,
            source_record_ref: record.id.clone(),
        }
    }

    /// Concept for a coded value
    ///
    /// An existing mapping decides: usable mappings give their concept,
    /// others the placeholder. Without one the value is resolved now.
    async fn concept_for(
        &self,
        job_id: &str,
        mapping_job: Option<&str>,
        table: CdmTable,
        field: &CodedField,
    ) -> PipelineResult<i64> {
        let key = MappingKey::new(job_id, &field.field_path, &field.code);
        let mut existing = db::mappings::get(&self.db, &key).await?;
        if existing.is_none() {
            if let Some(execution_job_id) = mapping_job {
                let alias_key = MappingKey::new(execution_job_id, &field.field_path, &field.code);
                existing = db::mappings::get(&self.db, &alias_key).await?;
            }
        }

        if let Some(mapping) = existing {
            return Ok(if mapping.status.is_usable() {
                mapping.concept_id
            } else {
                UNRESOLVED_CONCEPT_ID
            });
        }

        let suggestion = self
            .normalizer
            .resolve_value(&key, table.concept_domain(), None, None, &self.normalization)
            .await;
        match suggestion {
            Ok(s) if s.status.is_usable() => Ok(s.concept_id),
            Ok(_) => Ok(UNRESOLVED_CONCEPT_ID),
            Err(e) => {
                tracing::warn!(
                    job_id = %job_id,
                    field_path = %field.field_path,
                    source_value = %field.code,
                    error = %e,
                    "Synchronous resolution failed, using placeholder concept"
                );
                Ok(UNRESOLVED_CONCEPT_ID)
            }
        }
    }
}
