//! Review queue handlers
//!
//! GET /jobs/:id/review, POST /review/decision, POST /jobs/:id/review/bulk-approve

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::review_queue::ReviewStats;
use crate::error::{ApiError, ApiResult};
use crate::models::{MappingKey, ReviewQueueEntry, ReviewStatus};
use crate::services::{DecisionOutcome, ReviewDecision};
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ReviewListQuery {
    #[serde(default)]
    pub status: Option<ReviewStatus>,
}

#[derive(Debug, Serialize)]
pub struct ReviewListResponse {
    pub job_id: String,
    pub stats: ReviewStats,
    pub entries: Vec<ReviewQueueEntry>,
}

/// POST /review/decision request
#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub job_id: String,
    pub field_path: String,
    pub source_value: String,
    pub approver: String,
    #[serde(flatten)]
    pub decision: ReviewDecision,
}

/// POST /jobs/:id/review/bulk-approve request
#[derive(Debug, Deserialize)]
pub struct BulkApproveRequest {
    pub floor: f32,
    pub approver: String,
}

#[derive(Debug, Serialize)]
pub struct BulkApproveResponse {
    pub job_id: String,
    pub floor: f32,
    pub approved: u64,
}

/// GET /jobs/:id/review
pub async fn list_entries(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<ReviewListQuery>,
) -> ApiResult<Json<ReviewListResponse>> {
    let entries = state.review.list(&job_id, query.status).await?;
    let stats = state.review.stats(&job_id).await?;
    Ok(Json(ReviewListResponse {
        job_id,
        stats,
        entries,
    }))
}

/// POST /review/decision
pub async fn decide(
    State(state): State<AppState>,
    Json(request): Json<DecisionRequest>,
) -> ApiResult<Json<DecisionOutcome>> {
    let key = MappingKey::new(request.job_id, request.field_path, request.source_value);
    let outcome = state
        .review
        .decide(&key, request.decision, &request.approver)
        .await?;
    Ok(Json(outcome))
}

/// POST /jobs/:id/review/bulk-approve
pub async fn bulk_approve(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<BulkApproveRequest>,
) -> ApiResult<Json<BulkApproveResponse>> {
    if !request.floor.is_finite() {
        return Err(ApiError::BadRequest("floor must be a number".to_string()));
    }
    let approved = state
        .review
        .bulk_approve(&job_id, request.floor, &request.approver)
        .await?;
    Ok(Json(BulkApproveResponse {
        job_id,
        floor: request.floor,
        approved,
    }))
}

/// Build review routes
pub fn review_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/:id/review", get(list_entries))
        .route("/review/decision", post(decide))
        .route("/jobs/:id/review/bulk-approve", post(bulk_approve))
}
