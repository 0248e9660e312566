//! Review queue manager
//!
//! Human decisions on review-band mappings. A decision is (status, concept);
//! it is written to the queue entry and its concept mapping in one
//! transaction, and repeating an identical decision changes nothing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use cdm_common::events::{EventBus, PipelineEvent};

use crate::db;
use crate::db::review_queue::ReviewStats;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{
    CacheOrigin, ConceptCandidate, MappingKey, MappingStatus, ResolutionTier, ReviewQueueEntry,
    ReviewStatus,
};

/// Decision requested by a reviewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Accept the suggested concept
    Approve,
    /// Accept a different concept
    Override { concept_id: i64 },
    /// No valid concept; mapping falls back to the placeholder
    Reject,
    /// Back to pending
    Reopen,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewDecision::Approve => "approve",
            ReviewDecision::Override { .. } => "override",
            ReviewDecision::Reject => "reject",
            ReviewDecision::Reopen => "reopen",
        }
    }
}

/// Result of applying a decision
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    /// Entry after the decision
    pub entry: ReviewQueueEntry,
    /// `false` when the entry already held this decision
    pub changed: bool,
}

#[derive(Clone)]
pub struct ReviewQueueManager {
    db: SqlitePool,
    event_bus: EventBus,
}

impl ReviewQueueManager {
    pub fn new(db: SqlitePool, event_bus: EventBus) -> Self {
        Self { db, event_bus }
    }

    pub async fn list(
        &self,
        job_id: &str,
        status: Option<ReviewStatus>,
    ) -> PipelineResult<Vec<ReviewQueueEntry>> {
        Ok(db::review_queue::list(&self.db, job_id, status).await?)
    }

    pub async fn get(&self, key: &MappingKey) -> PipelineResult<ReviewQueueEntry> {
        db::review_queue::get(&self.db, key).await?.ok_or_else(|| {
            PipelineError::NotFound(format!(
                "review entry ({}, {}, {})",
                key.job_id, key.field_path, key.source_value
            ))
        })
    }

    pub async fn stats(&self, job_id: &str) -> PipelineResult<ReviewStats> {
        Ok(db::review_queue::stats(&self.db, job_id).await?)
    }

    pub async fn approve(&self, key: &MappingKey, approver: &str) -> PipelineResult<DecisionOutcome> {
        self.decide(key, ReviewDecision::Approve, approver).await
    }

    pub async fn override_concept(
        &self,
        key: &MappingKey,
        concept_id: i64,
        approver: &str,
    ) -> PipelineResult<DecisionOutcome> {
        self.decide(key, ReviewDecision::Override { concept_id }, approver).await
    }

    pub async fn reject(&self, key: &MappingKey, approver: &str) -> PipelineResult<DecisionOutcome> {
        self.decide(key, ReviewDecision::Reject, approver).await
    }

    pub async fn reopen(&self, key: &MappingKey, approver: &str) -> PipelineResult<DecisionOutcome> {
        self.decide(key, ReviewDecision::Reopen, approver).await
    }

    /// Approve every pending entry of a job at or above `floor`
    ///
    /// Returns the number of entries approved.
    pub async fn bulk_approve(&self, job_id: &str, floor: f32, approver: &str) -> PipelineResult<u64> {
        require_approver(approver)?;
        if !(0.0..=1.0).contains(&floor) {
            return Err(PipelineError::InvalidInput(format!("floor {} outside [0, 1]", floor)));
        }

        let entries = db::review_queue::pending_at_or_above(&self.db, job_id, floor).await?;
        let mut approved = 0;
        for entry in entries {
            if self.approve(&entry.key(), approver).await?.changed {
                approved += 1;
            }
        }

        tracing::info!(job_id = %job_id, floor, approved, approver = %approver, "Bulk approval");
        Ok(approved)
    }

    /// Apply any decision
    pub async fn decide(
        &self,
        key: &MappingKey,
        decision: ReviewDecision,
        approver: &str,
    ) -> PipelineResult<DecisionOutcome> {
        require_approver(approver)?;
        let approver = approver.trim();
        let entry = self.get(key).await?;
        let now = Utc::now();

        let changed = match &decision {
            ReviewDecision::Reopen => self.apply_reopen(&entry, approver, now).await?,
            _ => {
                let (status, chosen, tier) = self.resolve_decision(&entry, &decision).await?;
                self.apply(&entry, status, chosen, tier, approver, now).await?
            }
        };

        if changed {
            tracing::info!(
                job_id = %key.job_id,
                field_path = %key.field_path,
                source_value = %key.source_value,
                decision = decision.as_str(),
                approver = %approver,
                "Review decision applied"
            );
            self.event_bus.emit_lossy(PipelineEvent::ReviewDecided {
                job_id: key.job_id.clone(),
                field_path: key.field_path.clone(),
                source_value: key.source_value.clone(),
                decision: decision.as_str().to_string(),
                approver: approver.to_string(),
                timestamp: now,
            });
        }

        Ok(DecisionOutcome {
            entry: self.get(key).await?,
            changed,
        })
    }

    /// (review status, chosen concept, tier) of a non-reopen decision
    async fn resolve_decision(
        &self,
        entry: &ReviewQueueEntry,
        decision: &ReviewDecision,
    ) -> PipelineResult<(ReviewStatus, Option<ConceptCandidate>, ResolutionTier)> {
        match decision {
            ReviewDecision::Approve => {
                if entry.suggested.concept_id == crate::models::UNRESOLVED_CONCEPT_ID {
                    return Err(PipelineError::InvalidInput(
                        "suggested concept is the placeholder; override or reject instead".to_string(),
                    ));
                }
                Ok((ReviewStatus::Approved, Some(entry.suggested.clone()), entry.resolution_tier))
            }
            ReviewDecision::Override { concept_id } => {
                let concept = db::vocabulary::get_concept(&self.db, *concept_id, None)
                    .await?
                    .ok_or_else(|| PipelineError::InvalidInput(format!("unknown concept {}", concept_id)))?;
                Ok((
                    ReviewStatus::Approved,
                    Some(ConceptCandidate::from_concept(&concept, 1.0)),
                    ResolutionTier::Manual,
                ))
            }
            ReviewDecision::Reject => Ok((ReviewStatus::Rejected, None, entry.resolution_tier)),
            ReviewDecision::Reopen => Err(PipelineError::InvalidInput(
                "reopen is not a terminal decision".to_string(),
            )),
        }
    }

    async fn apply(
        &self,
        entry: &ReviewQueueEntry,
        status: ReviewStatus,
        chosen: Option<ConceptCandidate>,
        tier: ResolutionTier,
        approver: &str,
        now: chrono::DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let key = entry.key();
        let decided_concept_id = chosen.as_ref().map(|c| c.concept_id);
        let (mapping_concept, mapping_status, confidence) = match &chosen {
            Some(concept) => (concept.clone(), MappingStatus::Approved, 1.0),
            None => (ConceptCandidate::unresolved(), MappingStatus::Rejected, 0.0),
        };

        let mut tx = self.db.begin().await.map_err(cdm_common::Error::from)?;
        let changed = db::review_queue::apply_decision(
            &mut *tx,
            &key,
            status,
            decided_concept_id,
            approver,
            now,
        )
        .await?;
        if changed {
            db::mappings::write_human_decision(
                &mut *tx,
                &key,
                &mapping_concept,
                confidence,
                tier,
                mapping_status,
                approver,
                now,
            )
            .await?;
        }
        tx.commit().await.map_err(cdm_common::Error::from)?;

        if !changed {
            return Ok(false);
        }

        match &chosen {
            Some(concept) => {
                db::concept_cache::put_human(&self.db, &entry.system, &entry.source_value, concept).await?;
            }
            None => {
                self.drop_cached(&entry.system, &entry.source_value, entry.suggested.concept_id, None)
                    .await?;
            }
        }
        Ok(true)
    }

    async fn apply_reopen(
        &self,
        entry: &ReviewQueueEntry,
        approver: &str,
        now: chrono::DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let key = entry.key();
        let mut tx = self.db.begin().await.map_err(cdm_common::Error::from)?;
        let changed = db::review_queue::reopen(&mut *tx, &key, approver, now).await?;
        if changed {
            db::mappings::reopen(&mut *tx, &key, now).await?;
        }
        tx.commit().await.map_err(cdm_common::Error::from)?;

        if changed {
            if let Some(decided) = entry.decided_concept_id {
                self.drop_cached(&entry.system, &entry.source_value, decided, Some(CacheOrigin::Human))
                    .await?;
            }
        }
        Ok(changed)
    }

    /// Remove a cache entry only if it still points at `concept_id`
    async fn drop_cached(
        &self,
        system: &str,
        source_value: &str,
        concept_id: i64,
        origin: Option<CacheOrigin>,
    ) -> PipelineResult<()> {
        if let Some(cached) = db::concept_cache::get(&self.db, system, source_value).await? {
            if cached.concept_id == concept_id && origin.map_or(true, |o| o == cached.origin) {
                db::concept_cache::remove(&self.db, system, source_value).await?;
            }
        }
        Ok(())
    }
}

fn require_approver(approver: &str) -> PipelineResult<()> {
    if approver.trim().is_empty() {
        return Err(PipelineError::InvalidInput(
            "approver identity is required".to_string(),
        ));
    }
    Ok(())
}
