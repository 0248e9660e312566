//! Concept normalization
//!
//! Resolves source values of one field to standard concepts, tier by tier:
//! existing human decision, cache, direct code lookup, semantic similarity,
//! reasoning fallback, no match. The winning confidence is routed into the
//! auto-approve, review or reject band and persisted as a concept mapping.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cdm_common::config::TomlConfig;
use cdm_common::events::{EventBus, PipelineEvent};

use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    ConceptCandidate, ConceptMapping, MappingKey, MappingStatus, NormalizationSuggestion,
    ResolutionTier, ReviewQueueEntry, ReviewStatus,
};
use crate::services::embedding::{cosine_similarity, EmbeddingBackend};
use crate::services::reasoning_client::{
    ReasoningError, ReasoningRegistry, ReasoningRequest, DISABLED_PROVIDER,
};

/// Confidence of an exact code match in the domain vocabulary
pub const DIRECT_LOOKUP_CONFIDENCE: f32 = 0.95;

/// Concept names kept after the string-similarity prefilter
const SEMANTIC_PREFILTER: usize = 200;

/// Per-call normalization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub auto_approve_threshold: f32,
    pub review_floor: f32,
    pub similarity_threshold: f32,
    pub top_k: usize,
    /// Registered reasoning backend name, or `disabled`
    pub reasoning_provider: String,
    pub reasoning_timeout_ms: u64,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            auto_approve_threshold: 0.90,
            review_floor: 0.50,
            similarity_threshold: 0.90,
            top_k: 5,
            reasoning_provider: DISABLED_PROVIDER.to_string(),
            reasoning_timeout_ms: 10_000,
        }
    }
}

impl NormalizationConfig {
    pub fn from_toml(config: &TomlConfig) -> Self {
        Self {
            auto_approve_threshold: config.normalization.auto_approve_threshold,
            review_floor: config.normalization.review_floor,
            similarity_threshold: config.normalization.similarity_threshold,
            top_k: config.normalization.top_k,
            reasoning_provider: config.reasoning.provider.clone(),
            reasoning_timeout_ms: config.reasoning.timeout_ms,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !in_unit(self.review_floor) || !in_unit(self.auto_approve_threshold) {
            return Err("thresholds must lie in [0, 1]".to_string());
        }
        if self.review_floor > self.auto_approve_threshold {
            return Err(format!(
                "review floor {} exceeds auto-approve threshold {}",
                self.review_floor, self.auto_approve_threshold
            ));
        }
        if !in_unit(self.similarity_threshold) {
            return Err("similarity threshold must lie in [0, 1]".to_string());
        }
        if self.top_k == 0 {
            return Err("top_k must be at least 1".to_string());
        }
        Ok(())
    }

    /// Band a confidence into a mapping status
    pub fn route(&self, confidence: f32) -> MappingStatus {
        if confidence >= self.auto_approve_threshold {
            MappingStatus::AutoApproved
        } else if confidence >= self.review_floor {
            MappingStatus::PendingReview
        } else {
            MappingStatus::Rejected
        }
    }
}

/// Values of one field to normalize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRequest {
    pub job_id: String,
    pub field_path: String,
    /// Vocabulary domain (`Condition`, `Drug`, ...)
    pub domain: String,
    /// Source coding system; the domain is used when absent
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    pub values: Vec<String>,
}

struct Resolution {
    candidate: ConceptCandidate,
    confidence: f32,
    tier: ResolutionTier,
    rationale: Option<String>,
    alternatives: Vec<ConceptCandidate>,
}

impl Resolution {
    fn no_match(rationale: impl Into<String>, alternatives: Vec<ConceptCandidate>) -> Self {
        Self {
            candidate: ConceptCandidate::unresolved(),
            confidence: 0.0,
            tier: ResolutionTier::NoMatch,
            rationale: Some(rationale.into()),
            alternatives,
        }
    }
}

/// Normalization service
#[derive(Clone)]
pub struct ConceptNormalizer {
    db: SqlitePool,
    event_bus: EventBus,
    embedder: Arc<dyn EmbeddingBackend>,
    reasoning: ReasoningRegistry,
}

impl ConceptNormalizer {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        embedder: Arc<dyn EmbeddingBackend>,
        reasoning: ReasoningRegistry,
    ) -> Self {
        Self {
            db,
            event_bus,
            embedder,
            reasoning,
        }
    }

    pub fn reasoning_registry(&self) -> &ReasoningRegistry {
        &self.reasoning
    }

    /// Normalize the distinct values of a request
    pub async fn normalize(
        &self,
        request: &NormalizationRequest,
        config: &NormalizationConfig,
    ) -> PipelineResult<Vec<NormalizationSuggestion>> {
        config.validate().map_err(PipelineError::InvalidInput)?;
        for (name, value) in [
            ("job_id", &request.job_id),
            ("field_path", &request.field_path),
            ("domain", &request.domain),
        ] {
            if value.trim().is_empty() {
                return Err(PipelineError::InvalidInput(format!("{} is empty", name)));
            }
        }

        let mut seen = HashSet::new();
        let mut suggestions = Vec::new();
        for value in &request.values {
            let value = value.trim();
            if value.is_empty() || !seen.insert(value.to_string()) {
                continue;
            }

            let key = MappingKey::new(&request.job_id, &request.field_path, value);
            let suggestion = self
                .resolve_value(
                    &key,
                    &request.domain,
                    request.system.as_deref(),
                    request.context.as_deref(),
                    config,
                )
                .await?;
            suggestions.push(suggestion);
        }

        tracing::info!(
            job_id = %request.job_id,
            field_path = %request.field_path,
            values = suggestions.len(),
            auto_approved = suggestions.iter().filter(|s| s.status == MappingStatus::AutoApproved).count(),
            pending = suggestions.iter().filter(|s| s.status == MappingStatus::PendingReview).count(),
            "Normalization finished"
        );
        Ok(suggestions)
    }

    /// Distinct non-empty values of a field across a job's staged records
    pub async fn distinct_field_values(&self, job_id: &str, field_path: &str) -> PipelineResult<Vec<String>> {
        let records = db::staging::find_by_job(&self.db, job_id).await?;
        let mut seen = HashSet::new();
        Ok(records
            .iter()
            .filter_map(|r| r.payload.field(field_path))
            .map(|v| v.trim().to_string())
            .filter(|v| seen.insert(v.clone()))
            .collect())
    }

    /// Resolve, band and persist one value
    pub async fn resolve_value(
        &self,
        key: &MappingKey,
        domain: &str,
        system: Option<&str>,
        context: Option<&str>,
        config: &NormalizationConfig,
    ) -> PipelineResult<NormalizationSuggestion> {
        if let Some(mapping) = db::mappings::get(&self.db, key).await? {
            if mapping.is_human_decided() {
                return Ok(NormalizationSuggestion {
                    source_value: mapping.source_value,
                    concept_id: mapping.concept_id,
                    concept_name: mapping.concept_name,
                    vocabulary_id: mapping.vocabulary_id,
                    confidence: mapping.confidence,
                    resolution_tier: ResolutionTier::ApprovedMapping,
                    status: mapping.status,
                    rationale: mapping.approved_by.map(|who| format!("decided by {}", who)),
                });
            }
        }

        let system = system.unwrap_or(domain);
        let resolution = self.resolve_tiers(key, domain, system, context, config).await?;
        let status = config.route(resolution.confidence);

        let (concept, rationale) = if status == MappingStatus::Rejected
            && resolution.candidate.concept_id != crate::models::UNRESOLVED_CONCEPT_ID
        {
            let note = format!(
                "best candidate {} ({}) below review floor at {:.2}",
                resolution.candidate.concept_id, resolution.candidate.concept_name, resolution.confidence
            );
            (ConceptCandidate::unresolved(), Some(note))
        } else {
            (resolution.candidate.clone(), resolution.rationale.clone())
        };

        self.persist(key, system, &concept, &resolution, status, rationale.clone())
            .await?;

        tracing::debug!(
            job_id = %key.job_id,
            field_path = %key.field_path,
            source_value = %key.source_value,
            concept_id = concept.concept_id,
            tier = resolution.tier.as_str(),
            status = status.as_str(),
            "Value resolved"
        );

        Ok(NormalizationSuggestion {
            source_value: key.source_value.clone(),
            concept_id: concept.concept_id,
            concept_name: concept.concept_name,
            vocabulary_id: concept.vocabulary_id,
            confidence: resolution.confidence,
            resolution_tier: resolution.tier,
            status,
            rationale,
        })
    }

    async fn resolve_tiers(
        &self,
        key: &MappingKey,
        domain: &str,
        system: &str,
        context: Option<&str>,
        config: &NormalizationConfig,
    ) -> PipelineResult<Resolution> {
        let value = key.source_value.as_str();

        if let Some(entry) = db::concept_cache::get(&self.db, system, value).await? {
            return Ok(Resolution {
                candidate: ConceptCandidate {
                    concept_id: entry.concept_id,
                    concept_name: entry.concept_name,
                    vocabulary_id: entry.vocabulary_id,
                    score: entry.confidence,
                },
                confidence: entry.confidence,
                tier: ResolutionTier::Cache,
                rationale: Some(format!("cached {} resolution", entry.origin.as_str())),
                alternatives: Vec::new(),
            });
        }

        if let Some(concept) = db::vocabulary::lookup_code(&self.db, domain, value).await? {
            return Ok(Resolution {
                candidate: ConceptCandidate::from_concept(&concept, DIRECT_LOOKUP_CONFIDENCE),
                confidence: DIRECT_LOOKUP_CONFIDENCE,
                tier: ResolutionTier::DirectLookup,
                rationale: Some(format!("exact {} code match", concept.vocabulary_id)),
                alternatives: Vec::new(),
            });
        }

        let candidates = self.semantic_candidates(value, domain, config.top_k).await?;
        if let Some(best) = candidates.first() {
            if best.score >= config.similarity_threshold {
                return Ok(Resolution {
                    candidate: best.clone(),
                    confidence: best.score,
                    tier: ResolutionTier::Semantic,
                    rationale: Some(format!("name similarity {:.3}", best.score)),
                    alternatives: candidates[1..].to_vec(),
                });
            }
        }

        let Some(backend) = self.reasoning.get(&config.reasoning_provider) else {
            if !config.reasoning_provider.eq_ignore_ascii_case(DISABLED_PROVIDER) {
                tracing::warn!(
                    provider = %config.reasoning_provider,
                    "Reasoning provider not registered, using semantic result"
                );
            }
            return Ok(match candidates.split_first() {
                Some((best, rest)) => Resolution {
                    candidate: best.clone(),
                    confidence: best.score,
                    tier: ResolutionTier::Semantic,
                    rationale: Some(format!("best name similarity {:.3}", best.score)),
                    alternatives: rest.to_vec(),
                },
                None => Resolution::no_match("no candidate concepts in domain", Vec::new()),
            });
        };

        let request = ReasoningRequest {
            source_value: value.to_string(),
            field_path: key.field_path.clone(),
            domain: domain.to_string(),
            context: context.map(str::to_string),
            candidates: candidates.clone(),
        };

        let timeout = Duration::from_millis(config.reasoning_timeout_ms);
        let answer = match tokio::time::timeout(timeout, backend.resolve(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ReasoningError::Timeout(config.reasoning_timeout_ms)),
        };

        let response = match answer {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    provider = %backend.name(),
                    source_value = %value,
                    error = %e,
                    "Reasoning fallback failed"
                );
                return Ok(Resolution::no_match(format!("reasoning failed: {}", e), candidates));
            }
        };

        let Some(concept) = db::vocabulary::get_concept(&self.db, response.concept_id, Some(domain)).await? else {
            return Ok(Resolution::no_match(
                format!(
                    "reasoning answered concept {} which is not in domain {}",
                    response.concept_id, domain
                ),
                candidates,
            ));
        };

        // Backend alternatives first, then the semantic candidates
        let mut seen = HashSet::from([concept.concept_id]);
        let mut alternatives = Vec::new();
        for alt in &response.alternatives {
            if !seen.insert(alt.concept_id) {
                continue;
            }
            match db::vocabulary::get_concept(&self.db, alt.concept_id, Some(domain)).await? {
                Some(c) => alternatives.push(ConceptCandidate::from_concept(&c, alt.confidence)),
                None => tracing::debug!(
                    concept_id = alt.concept_id,
                    domain = %domain,
                    "Reasoning alternative outside domain, dropped"
                ),
            }
        }
        alternatives.extend(candidates.into_iter().filter(|c| seen.insert(c.concept_id)));

        Ok(Resolution {
            candidate: ConceptCandidate::from_concept(&concept, response.confidence),
            confidence: response.confidence,
            tier: ResolutionTier::Reasoning,
            rationale: Some(response.rationale).filter(|r| !r.is_empty()),
            alternatives,
        })
    }

    /// Top-k standard concepts of the domain by embedding similarity
    async fn semantic_candidates(
        &self,
        value: &str,
        domain: &str,
        top_k: usize,
    ) -> PipelineResult<Vec<ConceptCandidate>> {
        let mut concepts = db::vocabulary::standard_concepts_in_domain(&self.db, domain).await?;
        if concepts.is_empty() {
            return Ok(Vec::new());
        }

        let needle = value.to_lowercase();
        if concepts.len() > SEMANTIC_PREFILTER {
            let mut ranked: Vec<(f64, _)> = concepts
                .into_iter()
                .map(|c| (strsim::jaro_winkler(&needle, &c.concept_name.to_lowercase()), c))
                .collect();
            ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
            ranked.truncate(SEMANTIC_PREFILTER);
            concepts = ranked.into_iter().map(|(_, c)| c).collect();
        }

        let mut texts = Vec::with_capacity(concepts.len() + 1);
        texts.push(value.to_string());
        texts.extend(concepts.iter().map(|c| c.concept_name.clone()));

        let vectors = match self.embedder.embed(&texts).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(backend = self.embedder.name(), error = %e, "Embedding failed, skipping semantic tier");
                return Ok(Vec::new());
            }
        };
        let Some((source, names)) = vectors.split_first() else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<ConceptCandidate> = concepts
            .iter()
            .zip(names)
            .map(|(concept, vector)| {
                ConceptCandidate::from_concept(concept, cosine_similarity(source, vector).max(0.0))
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.concept_id.cmp(&b.concept_id)));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn persist(
        &self,
        key: &MappingKey,
        system: &str,
        concept: &ConceptCandidate,
        resolution: &Resolution,
        status: MappingStatus,
        rationale: Option<String>,
    ) -> PipelineResult<()> {
        let now = Utc::now();
        let mapping = ConceptMapping {
            job_id: key.job_id.clone(),
            field_path: key.field_path.clone(),
            source_value: key.source_value.clone(),
            concept_id: concept.concept_id,
            concept_name: concept.concept_name.clone(),
            vocabulary_id: concept.vocabulary_id.clone(),
            confidence: resolution.confidence,
            resolution_tier: resolution.tier,
            status,
            approved_by: None,
            created_at: now,
            updated_at: now,
        };
        if !db::mappings::upsert_automatic(&self.db, &mapping).await? {
            tracing::debug!(source_value = %key.source_value, "Human decision kept, automatic result dropped");
            return Ok(());
        }

        match status {
            MappingStatus::AutoApproved if resolution.tier != ResolutionTier::Cache => {
                db::concept_cache::put_automatic(
                    &self.db,
                    system,
                    &key.source_value,
                    concept,
                    resolution.confidence,
                )
                .await?;
            }
            MappingStatus::PendingReview => {
                let entry = ReviewQueueEntry {
                    job_id: key.job_id.clone(),
                    field_path: key.field_path.clone(),
                    source_value: key.source_value.clone(),
                    system: system.to_string(),
                    suggested: concept.clone(),
                    alternatives: resolution.alternatives.clone(),
                    confidence: resolution.confidence,
                    resolution_tier: resolution.tier,
                    rationale,
                    status: ReviewStatus::Pending,
                    decided_concept_id: None,
                    reviewed_by: None,
                    reviewed_at: None,
                    created_at: now,
                };
                if db::review_queue::upsert_pending(&self.db, &entry).await? {
                    self.event_bus.emit_lossy(PipelineEvent::ReviewQueued {
                        job_id: key.job_id.clone(),
                        field_path: key.field_path.clone(),
                        source_value: key.source_value.clone(),
                        confidence: resolution.confidence,
                        timestamp: now,
                    });
                }
            }
            _ => {}
        }

        // A stale pending entry (say after a reopen) no longer matches the mapping
        if matches!(status, MappingStatus::AutoApproved | MappingStatus::Rejected)
            && db::review_queue::discard_pending(&self.db, key).await?
        {
            tracing::info!(
                job_id = %key.job_id,
                field_path = %key.field_path,
                source_value = %key.source_value,
                status = status.as_str(),
                "Pending review entry closed by automatic result"
            );
        }
        Ok(())
    }
}
