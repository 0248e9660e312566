//! Table prediction and concept normalization handlers
//!
//! GET /jobs/:id/prediction, POST /jobs/:id/normalize

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiResult;
use crate::models::{NormalizationSuggestion, TablePrediction};
use crate::services::{NormalizationConfig, NormalizationRequest};
use crate::AppState;

/// `?fields=a,b,c` overrides the staged field schema
#[derive(Debug, Default, Deserialize)]
pub struct PredictionQuery {
    #[serde(default)]
    pub fields: Option<String>,
}

/// POST /jobs/:id/normalize request
#[derive(Debug, Deserialize)]
pub struct NormalizeRequest {
    pub field_path: String,
    pub domain: String,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    /// Values to resolve; the field's distinct staged values when absent
    #[serde(default)]
    pub values: Option<Vec<String>>,
    /// Per-call settings; service defaults when absent
    #[serde(default)]
    pub config: Option<NormalizationConfig>,
}

#[derive(Debug, Serialize)]
pub struct NormalizeResponse {
    pub job_id: String,
    pub field_path: String,
    pub suggestions: Vec<NormalizationSuggestion>,
}

/// GET /jobs/:id/prediction
pub async fn predict_table(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<PredictionQuery>,
) -> ApiResult<Json<TablePrediction>> {
    let fields = query.fields.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(String::from)
            .collect::<Vec<_>>()
    });
    let prediction = state.predictor.predict(&job_id, fields).await?;
    Ok(Json(prediction))
}

/// POST /jobs/:id/normalize
pub async fn normalize_field(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<NormalizeRequest>,
) -> ApiResult<Json<NormalizeResponse>> {
    let values = match request.values {
        Some(values) => values,
        None => {
            state
                .normalizer
                .distinct_field_values(&job_id, &request.field_path)
                .await?
        }
    };
    let config = request
        .config
        .unwrap_or_else(|| state.normalization_config.clone());

    let normalization = NormalizationRequest {
        job_id: job_id.clone(),
        field_path: request.field_path.clone(),
        domain: request.domain,
        system: request.system,
        context: request.context,
        values,
    };
    let suggestions = state.normalizer.normalize(&normalization, &config).await?;

    Ok(Json(NormalizeResponse {
        job_id,
        field_path: request.field_path,
        suggestions,
    }))
}

/// Build prediction and normalization routes
pub fn normalization_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/:id/prediction", get(predict_table))
        .route("/jobs/:id/normalize", post(normalize_field))
}
