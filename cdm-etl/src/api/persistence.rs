//! POST /jobs/:id/persist

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};

use crate::error::{ApiError, ApiResult, PipelineError};
use crate::models::PersistenceSummary;
use crate::services::PersistRequest;
use crate::AppState;

/// Materialize standardized rows for a job
///
/// An empty body predicts the target table. A job with no records anywhere
/// answers 404 with the stores that were checked.
pub async fn persist_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    body: Option<Json<PersistRequest>>,
) -> ApiResult<Json<PersistenceSummary>> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    match state.persistence.persist(&job_id, &request).await {
        Ok(summary) => Ok(Json(summary)),
        Err(e @ PipelineError::NoRecordsFound { .. }) => Err(e.into()),
        Err(e) => {
            state.record_error(format!("persistence of {}: {}", job_id, e)).await;
            Err(ApiError::from(e))
        }
    }
}

pub fn persistence_routes() -> Router<AppState> {
    Router::new().route("/jobs/:id/persist", post(persist_job))
}
