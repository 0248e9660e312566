//! Persistence engine integration tests

mod helpers;

use cdm_common::identity::surrogate_key;
use cdm_etl::db;
use cdm_etl::models::{CdmTable, PredictionTier, RecordSource};
use cdm_etl::services::{PersistRequest, ReasoningRegistry};
use cdm_etl::PipelineError;
use serde_json::json;

use helpers::{build_state, create_test_db, seed_vocabulary, stage_rows};

fn condition_table() -> PersistRequest {
    PersistRequest {
        table: Some(CdmTable::ConditionOccurrence),
    }
}

#[tokio::test]
async fn tc_per_001_other_jobs_records_never_leak() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    stage_rows(
        &pool,
        "A",
        &[
            json!({"patient_id": "P1", "diagnosis_code": "E11.9"}),
            json!({"patient_id": "P2", "diagnosis_code": "I10"}),
        ],
    )
    .await;

    let err = state.persistence.persist("B", &condition_table()).await.unwrap_err();
    match err {
        PipelineError::NoRecordsFound { job_id, stores_checked } => {
            assert_eq!(job_id, "B");
            assert_eq!(stores_checked[0], "staging_records");
            assert!(stores_checked.iter().any(|s| s == "job_aliases"));
            assert!(stores_checked.iter().any(|s| s == "resource_condition"));
        }
        other => panic!("expected NoRecordsFound, got {other:?}"),
    }

    assert_eq!(db::cdm_rows::count_table(&pool, CdmTable::ConditionOccurrence).await.unwrap(), 0);
    assert!(db::cdm_rows::list_by_job(&pool, "B", CdmTable::ConditionOccurrence)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn tc_per_002_rerun_is_idempotent() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    stage_rows(
        &pool,
        "A",
        &[
            json!({"patient_id": "P1", "diagnosis_code": "E11.9", "onset_date": "2024-03-01"}),
            json!({"patient_id": "P1", "diagnosis_code": "I10", "onset_date": "2024-03-01"}),
            json!({"patient_id": "P2", "diagnosis_code": "E10.9", "encounter_id": "V9"}),
        ],
    )
    .await;

    let first = state.persistence.persist("A", &condition_table()).await.unwrap();
    assert_eq!(first.total_records_found, 3);
    assert_eq!(first.inserted, 3);
    assert_eq!(first.unresolved_rows, 0);
    assert_eq!(first.source_used, RecordSource::Staging);
    let rows_before = db::cdm_rows::list_by_job(&pool, "A", CdmTable::ConditionOccurrence)
        .await
        .unwrap();

    let second = state.persistence.persist("A", &condition_table()).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated_or_skipped, 3);
    assert_eq!(db::cdm_rows::count_table(&pool, CdmTable::ConditionOccurrence).await.unwrap(), 3);

    let rows_after = db::cdm_rows::list_by_job(&pool, "A", CdmTable::ConditionOccurrence)
        .await
        .unwrap();
    let mut ids_before: Vec<(i64, i64)> = rows_before.iter().map(|r| (r.row_id, r.person_id)).collect();
    let mut ids_after: Vec<(i64, i64)> = rows_after.iter().map(|r| (r.row_id, r.person_id)).collect();
    ids_before.sort();
    ids_after.sort();
    assert_eq!(ids_before, ids_after);

    let p2 = rows_after
        .iter()
        .find(|r| r.source_value.as_deref() == Some("E10.9"))
        .unwrap();
    assert_eq!(p2.person_id, surrogate_key("person", &["P2"]));
    assert_eq!(p2.visit_occurrence_id, Some(surrogate_key("visit_occurrence", &["P2", "V9"])));
    assert_eq!(p2.concept_id, 201254);
}

#[tokio::test]
async fn tc_per_003_alias_resolves_execution_job() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    stage_rows(&pool, "exec-42", &[json!({"patient_id": "P1", "diagnosis_code": "E11.9"})]).await;
    db::aliases::register_alias(&pool, "study-7", "exec-42").await.unwrap();

    let summary = state.persistence.persist("study-7", &condition_table()).await.unwrap();
    assert_eq!(summary.total_records_found, 1);
    assert_eq!(summary.inserted, 1);
    assert_eq!(
        summary.source_used,
        RecordSource::StagingViaAlias {
            execution_job_id: "exec-42".to_string()
        }
    );
    assert_eq!(summary.stores_checked, vec!["staging_records", "job_aliases"]);

    let rows = db::cdm_rows::list_by_job(&pool, "study-7", CdmTable::ConditionOccurrence)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].concept_id, 201826);
}

#[tokio::test]
async fn tc_per_004_condition_record_discriminator_drives_table() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    stage_rows(
        &pool,
        "R",
        &[
            json!({
                "resourceType": "ConditionRecord",
                "subject": {"reference": "Patient/P1"},
                "code": {"coding": [{"system": "ICD10CM", "code": "E11.9"}]},
                "onsetDateTime": "2024-02-10"
            }),
            json!({
                "resourceType": "ConditionRecord",
                "subject": {"reference": "Patient/P2"},
                "code": {"coding": [{"system": "ICD10CM", "code": "I10"}]}
            }),
        ],
    )
    .await;

    let prediction = state.predictor.predict("R", None).await.unwrap();
    assert_eq!(prediction.table, CdmTable::ConditionOccurrence);
    assert!(prediction.confidence >= 0.95);
    assert_eq!(prediction.tier, PredictionTier::Discriminator);

    let summary = state.persistence.persist("R", &PersistRequest::default()).await.unwrap();
    assert_eq!(summary.table, CdmTable::ConditionOccurrence);
    assert_eq!(summary.inserted, 2);

    let rows = db::cdm_rows::list_by_job(&pool, "R", CdmTable::ConditionOccurrence)
        .await
        .unwrap();
    let p1 = rows
        .iter()
        .find(|r| r.person_id == surrogate_key("person", &["P1"]))
        .unwrap();
    assert_eq!(p1.concept_id, 201826);
    assert_eq!(
        p1.row_fields.get("condition_start_date").and_then(|v| v.as_str()),
        Some("2024-02-10")
    );
}

#[tokio::test]
async fn tc_per_005_resource_store_documents_are_found() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    db::resource_stores::insert_resource(
        &pool,
        "feed-1",
        &json!({
            "resourceType": "Condition",
            "subject": {"reference": "Patient/P5"},
            "code": {"coding": [{"code": "I10"}]}
        }),
    )
    .await
    .unwrap();

    let summary = state.persistence.persist("feed-1", &PersistRequest::default()).await.unwrap();
    assert_eq!(summary.table, CdmTable::ConditionOccurrence);
    assert_eq!(summary.inserted, 1);
    assert_eq!(
        summary.source_used,
        RecordSource::ResourceStores {
            stores: vec!["resource_condition".to_string()]
        }
    );
}

#[tokio::test]
async fn tc_per_006_same_day_measurements_stay_distinct() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    stage_rows(
        &pool,
        "LAB",
        &[
            json!({"patient_id": "P1", "loinc_code": "2345-7", "result_date": "2024-01-01", "value": "90"}),
            json!({"patient_id": "P1", "loinc_code": "2345-7", "result_date": "2024-01-01", "value": "140"}),
        ],
    )
    .await;
    let request = PersistRequest {
        table: Some(CdmTable::Measurement),
    };

    let first = state.persistence.persist("LAB", &request).await.unwrap();
    assert_eq!(first.inserted, 2);

    let rows = db::cdm_rows::list_by_job(&pool, "LAB", CdmTable::Measurement).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_ne!(rows[0].row_id, rows[1].row_id);
    let mut values: Vec<&str> = rows
        .iter()
        .filter_map(|r| r.row_fields.get("value_source_value").and_then(|v| v.as_str()))
        .collect();
    values.sort();
    assert_eq!(values, vec!["140", "90"]);

    let second = state.persistence.persist("LAB", &request).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated_or_skipped, 2);
    assert_eq!(db::cdm_rows::count_table(&pool, CdmTable::Measurement).await.unwrap(), 2);
}

#[tokio::test]
async fn tc_per_007_multi_coded_document_yields_one_row() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    stage_rows(
        &pool,
        "DOC",
        &[
            // SNOMED code is not in the vocabulary; the ICD10 coding resolves
            json!({
                "resourceType": "Condition",
                "subject": {"reference": "Patient/P1"},
                "code": {"coding": [
                    {"system": "http://snomed.info/sct", "code": "44054006"},
                    {"system": "ICD10CM", "code": "E11.9"}
                ]}
            }),
            // Both resolve; the first wins
            json!({
                "resourceType": "Condition",
                "subject": {"reference": "Patient/P2"},
                "code": {"coding": [
                    {"system": "ICD10CM", "code": "I10"},
                    {"system": "ICD10CM", "code": "E11.9"}
                ]}
            }),
        ],
    )
    .await;

    let summary = state.persistence.persist("DOC", &condition_table()).await.unwrap();
    assert_eq!(summary.inserted, 2);
    assert_eq!(summary.unresolved_rows, 0);

    let rows = db::cdm_rows::list_by_job(&pool, "DOC", CdmTable::ConditionOccurrence)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    let p1 = rows
        .iter()
        .find(|r| r.person_id == surrogate_key("person", &["P1"]))
        .unwrap();
    assert_eq!(p1.concept_id, 201826);
    assert_eq!(p1.source_value.as_deref(), Some("E11.9"));
    assert_eq!(p1.field_path.as_deref(), Some("code.coding.1.code"));

    let p2 = rows
        .iter()
        .find(|r| r.person_id == surrogate_key("person", &["P2"]))
        .unwrap();
    assert_eq!(p2.concept_id, 320128);
    assert_eq!(p2.source_value.as_deref(), Some("I10"));
}
