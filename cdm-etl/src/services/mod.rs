//! Pipeline services
//!
//! Ingestion, table prediction, concept normalization, review and persistence,
//! plus the external capabilities they consume (source connectors, embedding
//! and reasoning backends).

pub mod concept_normalizer;
pub mod embedding;
pub mod ingestion_engine;
pub mod persistence_engine;
pub mod reasoning_client;
pub mod review_queue;
pub mod source_connector;
pub mod table_predictor;
pub mod table_rules;

pub use concept_normalizer::{ConceptNormalizer, NormalizationConfig, NormalizationRequest};
pub use embedding::{EmbeddingBackend, EmbeddingError, HttpEmbeddingClient, TrigramEmbedder};
pub use ingestion_engine::{IngestionEngine, IngestionSettings, JobOutcome, WriteOutcome};
pub use persistence_engine::{PersistRequest, PersistenceEngine};
pub use reasoning_client::{
    HttpReasoningClient, ReasoningAlternative, ReasoningBackend, ReasoningError, ReasoningRegistry,
    ReasoningRequest, ReasoningResponse,
};
pub use review_queue::{DecisionOutcome, ReviewDecision, ReviewQueueManager};
pub use source_connector::{
    ChannelConnector, ConnectorError, DeadLetterReplayConnector, JsonLinesConnector,
    MemoryConnector, SourceConnector,
};
pub use table_predictor::{PredictorWeights, TablePredictor};
