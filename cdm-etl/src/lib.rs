//! cdm-etl library interface
//!
//! Exposes the pipeline services and the HTTP router for the binary and for
//! integration tests.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{ApiError, ApiResult, PipelineError, PipelineResult};

use axum::Router;
use cdm_common::config::TomlConfig;
use cdm_common::events::EventBus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::services::{
    ConceptNormalizer, EmbeddingBackend, IngestionEngine, IngestionSettings, NormalizationConfig,
    PersistenceEngine, PredictorWeights, ReasoningRegistry, ReviewQueueManager, TablePredictor,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    pub ingestion: IngestionEngine,
    pub predictor: TablePredictor,
    pub normalizer: ConceptNormalizer,
    pub review: ReviewQueueManager,
    pub persistence: PersistenceEngine,
    /// Normalization settings used when a request does not carry its own
    pub normalization_config: NormalizationConfig,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last error for diagnostic purposes
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        event_bus: EventBus,
        toml_config: &TomlConfig,
        embedder: Arc<dyn EmbeddingBackend>,
        reasoning: ReasoningRegistry,
    ) -> Self {
        let normalization_config = NormalizationConfig::from_toml(toml_config);
        let weights = PredictorWeights::from(&toml_config.predictor);

        let normalizer = ConceptNormalizer::new(db.clone(), event_bus.clone(), embedder, reasoning);
        let persistence = PersistenceEngine::new(
            db.clone(),
            event_bus.clone(),
            normalizer.clone(),
            normalization_config.clone(),
            weights,
        );

        Self {
            ingestion: IngestionEngine::new(
                db.clone(),
                event_bus.clone(),
                IngestionSettings::from(&toml_config.ingestion),
            ),
            predictor: TablePredictor::new(db.clone(), weights),
            review: ReviewQueueManager::new(db.clone(), event_bus.clone()),
            normalizer,
            persistence,
            normalization_config,
            db,
            event_bus,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Remember an error for `/health`
    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.write().await = Some(message.into());
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::job_routes())
        .merge(api::normalization_routes())
        .merge(api::review_routes())
        .merge(api::persistence_routes())
        .merge(api::event_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
