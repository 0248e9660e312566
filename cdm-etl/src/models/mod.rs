//! Data models for the ingestion-to-standardized-model pipeline
//!
//! - Job state machine and metrics
//! - Raw/staged/dead-letter records
//! - Concept mappings and review entries
//! - Standardized rows and persistence summaries

pub mod job;
pub mod mapping;
pub mod record;
pub mod standardized;
pub mod transform;

pub use job::{Job, JobMetrics, JobState, StateTransition};
pub use mapping::{
    CacheEntry, CacheOrigin, Concept, ConceptCandidate, ConceptMapping, MappingKey, MappingStatus,
    NormalizationSuggestion, ResolutionTier, ReviewQueueEntry, ReviewStatus, UNRESOLVED_CONCEPT_ID,
};
pub use record::{DeadLetterRecord, RawRecord, SourceItem, StagingRecord, StagingStatus};
pub use standardized::{
    CdmTable, PersistenceSummary, PredictionTier, RecordSource, StandardizedRow, TableAlternative,
    TablePrediction,
};
pub use transform::FieldTransform;
