//! Concept normalization and review integration tests

mod helpers;

use cdm_etl::db;
use cdm_etl::models::{MappingKey, MappingStatus, ResolutionTier, ReviewStatus, UNRESOLVED_CONCEPT_ID};
use cdm_etl::services::{NormalizationConfig, NormalizationRequest, ReasoningRegistry};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use helpers::{build_state, create_test_db, seed_vocabulary, ScriptedReasoner};

fn request(job_id: &str, values: &[&str]) -> NormalizationRequest {
    NormalizationRequest {
        job_id: job_id.to_string(),
        field_path: "diagnosis_code".to_string(),
        domain: "Condition".to_string(),
        system: None,
        context: None,
        values: values.iter().map(|v| v.to_string()).collect(),
    }
}

fn with_reasoner(provider: &str) -> NormalizationConfig {
    NormalizationConfig {
        reasoning_provider: provider.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn tc_norm_001_direct_lookup_is_auto_approved_and_cached() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;
    let state = build_state(pool.clone(), ReasoningRegistry::new());

    let suggestions = state
        .normalizer
        .normalize(&request("J1", &["E11.9"]), &NormalizationConfig::default())
        .await
        .unwrap();

    assert_eq!(suggestions.len(), 1);
    let s = &suggestions[0];
    assert_eq!(s.concept_id, 201826);
    assert_eq!(s.confidence, 0.95);
    assert_eq!(s.resolution_tier, ResolutionTier::DirectLookup);
    assert_eq!(s.status, MappingStatus::AutoApproved);

    let cached = db::concept_cache::get(&pool, "Condition", "E11.9").await.unwrap().unwrap();
    assert_eq!(cached.concept_id, 201826);

    // Second job hits the cache
    let again = state
        .normalizer
        .normalize(&request("J2", &["E11.9"]), &NormalizationConfig::default())
        .await
        .unwrap();
    assert_eq!(again[0].resolution_tier, ResolutionTier::Cache);
    assert_eq!(again[0].concept_id, 201826);
}

#[tokio::test]
async fn tc_norm_002_confidence_bands_partition_results() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let reasoner = ScriptedReasoner::new("mock")
        .answer("sugar illness", 201826, 0.95)
        .answer("high bp", 320128, 0.70)
        .answer("unclear note", 201254, 0.30);
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(reasoner));
    let state = build_state(pool.clone(), registry);

    let suggestions = state
        .normalizer
        .normalize(
            &request("J1", &["sugar illness", "high bp", "unclear note"]),
            &with_reasoner("mock"),
        )
        .await
        .unwrap();
    assert_eq!(suggestions.len(), 3);

    let by_value = |v: &str| suggestions.iter().find(|s| s.source_value == v).unwrap();
    assert_eq!(by_value("sugar illness").status, MappingStatus::AutoApproved);
    assert_eq!(by_value("sugar illness").concept_id, 201826);
    assert_eq!(by_value("high bp").status, MappingStatus::PendingReview);
    assert_eq!(by_value("high bp").concept_id, 320128);
    assert_eq!(by_value("unclear note").status, MappingStatus::Rejected);
    assert_eq!(by_value("unclear note").concept_id, UNRESOLVED_CONCEPT_ID);

    let pending = state.review.list("J1", Some(ReviewStatus::Pending)).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_value, "high bp");

    // Only auto-approved results reach the cache
    assert!(db::concept_cache::get(&pool, "Condition", "sugar illness").await.unwrap().is_some());
    assert!(db::concept_cache::get(&pool, "Condition", "high bp").await.unwrap().is_none());
    assert!(db::concept_cache::get(&pool, "Condition", "unclear note").await.unwrap().is_none());
}

#[tokio::test]
async fn tc_norm_003_approved_mapping_skips_reasoning() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let reasoner = ScriptedReasoner::new("mock").answer("X", 201826, 0.70);
    let calls = reasoner.calls();
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(reasoner));
    let state = build_state(pool.clone(), registry);
    let config = with_reasoner("mock");

    let first = state.normalizer.normalize(&request("J1", &["X"]), &config).await.unwrap();
    assert_eq!(first[0].status, MappingStatus::PendingReview);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let key = MappingKey::new("J1", "diagnosis_code", "X");
    let outcome = state.review.approve(&key, "dr.lee").await.unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.entry.status, ReviewStatus::Approved);

    let second = state.normalizer.normalize(&request("J1", &["X"]), &config).await.unwrap();
    assert_eq!(second[0].resolution_tier, ResolutionTier::ApprovedMapping);
    assert_eq!(second[0].concept_id, 201826);
    assert_eq!(second[0].status, MappingStatus::Approved);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Repeating the decision changes nothing
    let repeat = state.review.approve(&key, "dr.lee").await.unwrap();
    assert!(!repeat.changed);
}

#[tokio::test]
async fn tc_norm_004_reasoning_timeout_is_no_match() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let reasoner = ScriptedReasoner::new("slow")
        .answer("sugar illness", 201826, 0.99)
        .delayed(Duration::from_millis(500));
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(reasoner));
    let state = build_state(pool.clone(), registry);

    let config = NormalizationConfig {
        reasoning_provider: "slow".to_string(),
        reasoning_timeout_ms: 20,
        ..Default::default()
    };
    let suggestions = state
        .normalizer
        .normalize(&request("J1", &["sugar illness"]), &config)
        .await
        .unwrap();

    assert_eq!(suggestions[0].resolution_tier, ResolutionTier::NoMatch);
    assert_eq!(suggestions[0].status, MappingStatus::Rejected);
    assert_eq!(suggestions[0].concept_id, UNRESOLVED_CONCEPT_ID);
    assert!(state.review.list("J1", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn tc_norm_005_bulk_approve_respects_floor() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let reasoner = ScriptedReasoner::new("mock")
        .answer("high bp", 320128, 0.80)
        .answer("sugar illness", 201826, 0.60);
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(reasoner));
    let state = build_state(pool.clone(), registry);

    state
        .normalizer
        .normalize(&request("J1", &["high bp", "sugar illness"]), &with_reasoner("mock"))
        .await
        .unwrap();
    assert_eq!(state.review.stats("J1").await.unwrap().pending, 2);

    let approved = state.review.bulk_approve("J1", 0.75, "dr.lee").await.unwrap();
    assert_eq!(approved, 1);

    let stats = state.review.stats("J1").await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.approved, 1);

    let mapping = db::mappings::get(&pool, &MappingKey::new("J1", "diagnosis_code", "high bp"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mapping.status, MappingStatus::Approved);
    assert_eq!(mapping.approved_by.as_deref(), Some("dr.lee"));
}

#[tokio::test]
async fn tc_norm_006_reject_sets_placeholder_concept() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let reasoner = ScriptedReasoner::new("mock").answer("high bp", 320128, 0.70);
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(reasoner));
    let state = build_state(pool.clone(), registry);

    state
        .normalizer
        .normalize(&request("J1", &["high bp"]), &with_reasoner("mock"))
        .await
        .unwrap();

    let key = MappingKey::new("J1", "diagnosis_code", "high bp");
    let outcome = state.review.reject(&key, "dr.lee").await.unwrap();
    assert_eq!(outcome.entry.status, ReviewStatus::Rejected);

    let mapping = db::mappings::get(&pool, &key).await.unwrap().unwrap();
    assert_eq!(mapping.status, MappingStatus::Rejected);
    assert_eq!(mapping.concept_id, UNRESOLVED_CONCEPT_ID);
}

#[tokio::test]
async fn tc_norm_007_reasoning_alternatives_reach_review() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let reasoner = ScriptedReasoner::new("mock")
        .answer("high bp", 320128, 0.70)
        // Chosen concept, a Gender concept and a repeat are all dropped
        .alternatives("high bp", &[(201826, 0.40), (320128, 0.35), (8507, 0.20), (201826, 0.10)]);
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(reasoner));
    let state = build_state(pool.clone(), registry);

    state
        .normalizer
        .normalize(&request("J1", &["high bp"]), &with_reasoner("mock"))
        .await
        .unwrap();

    let entry = state
        .review
        .get(&MappingKey::new("J1", "diagnosis_code", "high bp"))
        .await
        .unwrap();
    assert_eq!(entry.suggested.concept_id, 320128);

    let ids: Vec<i64> = entry.alternatives.iter().map(|c| c.concept_id).collect();
    assert_eq!(ids, vec![201826, 201254]);
    assert_eq!(entry.alternatives[0].score, 0.40);
}

#[tokio::test]
async fn tc_norm_008_automatic_result_closes_reopened_entry() {
    let (_dir, pool) = create_test_db().await;
    seed_vocabulary(&pool).await;

    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(ScriptedReasoner::new("mock").answer("high bp", 320128, 0.70)));
    let state = build_state(pool.clone(), registry);

    state
        .normalizer
        .normalize(&request("J1", &["high bp"]), &with_reasoner("mock"))
        .await
        .unwrap();
    let key = MappingKey::new("J1", "diagnosis_code", "high bp");
    state.review.approve(&key, "dr.lee").await.unwrap();
    let reopened = state.review.reopen(&key, "dr.lee").await.unwrap();
    assert_eq!(reopened.entry.status, ReviewStatus::Pending);

    // A later run is confident enough to auto-approve
    let mut registry = ReasoningRegistry::new();
    registry.register(Arc::new(ScriptedReasoner::new("mock").answer("high bp", 320128, 0.95)));
    let state = build_state(pool.clone(), registry);

    let suggestions = state
        .normalizer
        .normalize(&request("J1", &["high bp"]), &with_reasoner("mock"))
        .await
        .unwrap();
    assert_eq!(suggestions[0].status, MappingStatus::AutoApproved);

    let mapping = db::mappings::get(&pool, &key).await.unwrap().unwrap();
    assert_eq!(mapping.status, MappingStatus::AutoApproved);
    assert!(db::review_queue::get(&pool, &key).await.unwrap().is_none());
    assert_eq!(state.review.stats("J1").await.unwrap().pending, 0);
}
