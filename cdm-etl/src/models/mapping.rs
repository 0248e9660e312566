//! Concept mappings, cache entries and review queue entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Placeholder concept for unresolved source values
pub const UNRESOLVED_CONCEPT_ID: i64 = 0;

/// Standard vocabulary entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_code: String,
    /// "S" for standard concepts
    pub standard_concept: Option<String>,
}

/// Mapping lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    AutoApproved,
    PendingReview,
    Approved,
    Rejected,
}

impl MappingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingStatus::AutoApproved => "auto_approved",
            MappingStatus::PendingReview => "pending_review",
            MappingStatus::Approved => "approved",
            MappingStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_approved" => Some(MappingStatus::AutoApproved),
            "pending_review" => Some(MappingStatus::PendingReview),
            "approved" => Some(MappingStatus::Approved),
            "rejected" => Some(MappingStatus::Rejected),
            _ => None,
        }
    }

    /// Usable as an authoritative concept during persistence
    pub fn is_usable(&self) -> bool {
        matches!(self, MappingStatus::AutoApproved | MappingStatus::Approved)
    }
}

/// Tier that produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTier {
    /// Existing human decision for the same (job, field, value)
    ApprovedMapping,
    Cache,
    DirectLookup,
    Semantic,
    Reasoning,
    /// Human override in the review queue
    Manual,
    NoMatch,
}

impl ResolutionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionTier::ApprovedMapping => "approved_mapping",
            ResolutionTier::Cache => "cache",
            ResolutionTier::DirectLookup => "direct_lookup",
            ResolutionTier::Semantic => "semantic",
            ResolutionTier::Reasoning => "reasoning",
            ResolutionTier::Manual => "manual",
            ResolutionTier::NoMatch => "no_match",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved_mapping" => Some(ResolutionTier::ApprovedMapping),
            "cache" => Some(ResolutionTier::Cache),
            "direct_lookup" => Some(ResolutionTier::DirectLookup),
            "semantic" => Some(ResolutionTier::Semantic),
            "reasoning" => Some(ResolutionTier::Reasoning),
            "manual" => Some(ResolutionTier::Manual),
            "no_match" => Some(ResolutionTier::NoMatch),
            _ => None,
        }
    }
}

/// Normalized mapping for one (job, field, source value)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptMapping {
    pub job_id: String,
    pub field_path: String,
    pub source_value: String,
    pub concept_id: i64,
    pub concept_name: String,
    pub vocabulary_id: String,
    pub confidence: f32,
    pub resolution_tier: ResolutionTier,
    pub status: MappingStatus,
    /// Set only by human decisions
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConceptMapping {
    /// Human decisions are never overwritten by automatic resolution
    pub fn is_human_decided(&self) -> bool {
        self.approved_by.is_some()
    }
}

/// Who produced a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOrigin {
    Automatic,
    Human,
}

impl CacheOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOrigin::Automatic => "automatic",
            CacheOrigin::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "automatic" => Some(CacheOrigin::Automatic),
            "human" => Some(CacheOrigin::Human),
            _ => None,
        }
    }
}

/// (system, source value) → concept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub system: String,
    pub source_value: String,
    pub concept_id: i64,
    pub concept_name: String,
    pub vocabulary_id: String,
    pub confidence: f32,
    pub origin: CacheOrigin,
    pub updated_at: DateTime<Utc>,
}

/// Candidate concept with a score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptCandidate {
    pub concept_id: i64,
    pub concept_name: String,
    pub vocabulary_id: String,
    pub score: f32,
}

impl ConceptCandidate {
    pub fn from_concept(concept: &Concept, score: f32) -> Self {
        Self {
            concept_id: concept.concept_id,
            concept_name: concept.concept_name.clone(),
            vocabulary_id: concept.vocabulary_id.clone(),
            score,
        }
    }

    pub fn unresolved() -> Self {
        Self {
            concept_id: UNRESOLVED_CONCEPT_ID,
            concept_name: "No matching concept".to_string(),
            vocabulary_id: "None".to_string(),
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }
}

/// Key of a review entry and of its concept mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingKey {
    pub job_id: String,
    pub field_path: String,
    pub source_value: String,
}

impl MappingKey {
    pub fn new(
        job_id: impl Into<String>,
        field_path: impl Into<String>,
        source_value: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            field_path: field_path.into(),
            source_value: source_value.into(),
        }
    }
}

/// Review-band result awaiting a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueEntry {
    pub job_id: String,
    pub field_path: String,
    pub source_value: String,
    /// Cache key system of the source value
    pub system: String,
    pub suggested: ConceptCandidate,
    pub alternatives: Vec<ConceptCandidate>,
    pub confidence: f32,
    pub resolution_tier: ResolutionTier,
    pub rationale: Option<String>,
    pub status: ReviewStatus,
    /// Concept chosen by the reviewer (suggested one unless overridden)
    pub decided_concept_id: Option<i64>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ReviewQueueEntry {
    pub fn key(&self) -> MappingKey {
        MappingKey::new(&self.job_id, &self.field_path, &self.source_value)
    }
}

/// One normalization result returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSuggestion {
    pub source_value: String,
    pub concept_id: i64,
    pub concept_name: String,
    pub vocabulary_id: String,
    pub confidence: f32,
    pub resolution_tier: ResolutionTier,
    pub status: MappingStatus,
    pub rationale: Option<String>,
}

impl NormalizationSuggestion {
    pub fn is_unresolved(&self) -> bool {
        self.concept_id == UNRESOLVED_CONCEPT_ID
    }
}
