//! Database test utilities

use cdm_common::config::TomlConfig;
use cdm_common::events::EventBus;
use cdm_etl::models::{Concept, RawRecord, StagingRecord};
use cdm_etl::services::{ReasoningRegistry, TrigramEmbedder};
use cdm_etl::AppState;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tempfile::TempDir;

/// Create a temporary file-backed database with all tables
///
/// Returns (TempDir, SqlitePool) - TempDir must be kept alive for the test
pub async fn create_test_db() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("temp dir");
    let db_path = temp_dir.path().join("cdm-test.db");
    let pool = cdm_etl::db::init_database_pool(&db_path)
        .await
        .expect("database pool");
    (temp_dir, pool)
}

pub fn concept(id: i64, name: &str, domain: &str, vocabulary: &str, code: &str) -> Concept {
    Concept {
        concept_id: id,
        concept_name: name.to_string(),
        domain_id: domain.to_string(),
        vocabulary_id: vocabulary.to_string(),
        concept_code: code.to_string(),
        standard_concept: Some("S".to_string()),
    }
}

/// Small Condition/Drug/Gender vocabulary
pub async fn seed_vocabulary(pool: &SqlitePool) {
    cdm_etl::db::vocabulary::insert_concepts(
        pool,
        &[
            concept(201826, "Type 2 diabetes mellitus", "Condition", "ICD10CM", "E11.9"),
            concept(201254, "Type 1 diabetes mellitus", "Condition", "ICD10CM", "E10.9"),
            concept(320128, "Essential hypertension", "Condition", "ICD10CM", "I10"),
            concept(1503297, "Metformin", "Drug", "RxNorm", "6809"),
            concept(8507, "Male", "Gender", "Gender", "M"),
            concept(8532, "Female", "Gender", "Gender", "F"),
        ],
    )
    .await
    .expect("seed vocabulary");
}

/// Write rows straight into the staging store of a job
pub async fn stage_rows(pool: &SqlitePool, job_id: &str, rows: &[Value]) {
    for row in rows {
        let record = StagingRecord::new(job_id, RawRecord::classify(row.clone()).expect("row"));
        cdm_etl::db::staging::insert_record(pool, &record)
            .await
            .expect("staging insert");
    }
}

/// Application state with the trigram embedder and the given reasoning backends
pub fn build_state(pool: SqlitePool, reasoning: ReasoningRegistry) -> AppState {
    AppState::new(
        pool,
        EventBus::new(256),
        &TomlConfig::default(),
        Arc::new(TrigramEmbedder),
        reasoning,
    )
}
