//! Ingestion job API handlers
//!
//! POST /jobs, GET /jobs/:id, POST /jobs/:id/{records,file,stop,replay,aliases},
//! GET /jobs/:id/dead-letters

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ApiResult, PipelineError};
use crate::models::{DeadLetterRecord, FieldTransform, Job, JobState};
use crate::services::{JsonLinesConnector, MemoryConnector};
use crate::AppState;

/// POST /jobs request
#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    /// Explicit job id; generated when absent
    #[serde(default)]
    pub job_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub config: FieldTransform,
}

/// GET /jobs/:id response
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: Job,
    pub running: bool,
}

/// POST /jobs/:id/records request
#[derive(Debug, Deserialize)]
pub struct InlineRecordsRequest {
    pub records: Vec<Value>,
}

/// POST /jobs/:id/file request
#[derive(Debug, Deserialize)]
pub struct FileSourceRequest {
    pub path: String,
}

/// `?wait=true` runs the job to completion before responding
#[derive(Debug, Default, Deserialize)]
pub struct RunOptions {
    #[serde(default)]
    pub wait: bool,
}

/// Response of the start endpoints
#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub job_id: String,
    pub state: JobState,
    /// Set when the caller waited for completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StopJobResponse {
    pub job_id: String,
    pub stop_requested: bool,
}

/// POST /jobs/:id/replay request
#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: FieldTransform,
}

/// POST /jobs/:id/aliases request
#[derive(Debug, Deserialize)]
pub struct AliasRequest {
    pub execution_job_id: String,
}

#[derive(Debug, Serialize)]
pub struct AliasResponse {
    pub logical_job_id: String,
    pub execution_job_id: String,
}

/// POST /jobs
pub async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    if request.name.trim().is_empty() {
        return Err(ApiError::BadRequest("job name is required".to_string()));
    }
    let job = state
        .ingestion
        .create_job(request.job_id, &request.name, request.config)
        .await
        .map_err(|e| match e {
            // Invalid transform config is a client error at creation time
            PipelineError::Configuration(msg) => ApiError::BadRequest(msg),
            other => other.into(),
        })?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs/:id
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = state.ingestion.job_status(&job_id).await?;
    let running = state.ingestion.is_running(&job_id).await;
    Ok(Json(JobStatusResponse { job, running }))
}

/// POST /jobs/:id/records
pub async fn start_with_records(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(options): Query<RunOptions>,
    Json(request): Json<InlineRecordsRequest>,
) -> ApiResult<(StatusCode, Json<StartJobResponse>)> {
    let connector = MemoryConnector::new(request.records);
    start(&state, &job_id, connector, options).await
}

/// POST /jobs/:id/file
pub async fn start_with_file(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(options): Query<RunOptions>,
    Json(request): Json<FileSourceRequest>,
) -> ApiResult<(StatusCode, Json<StartJobResponse>)> {
    let connector = JsonLinesConnector::open(std::path::Path::new(&request.path))
        .await
        .map_err(PipelineError::from)?;
    start(&state, &job_id, connector, options).await
}

async fn start<C>(
    state: &AppState,
    job_id: &str,
    connector: C,
    options: RunOptions,
) -> ApiResult<(StatusCode, Json<StartJobResponse>)>
where
    C: crate::services::SourceConnector + 'static,
{
    if options.wait {
        let outcome = state
            .ingestion
            .run_job(job_id, connector, CancellationToken::new())
            .await?;
        if let Some(error) = &outcome.job.error {
            state.record_error(format!("job {}: {}", job_id, error)).await;
        }
        return Ok((
            StatusCode::OK,
            Json(StartJobResponse {
                job_id: job_id.to_string(),
                state: outcome.job.state,
                stopped: Some(outcome.stopped),
                job: Some(outcome.job),
            }),
        ));
    }

    state.ingestion.spawn_job(job_id, connector).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartJobResponse {
            job_id: job_id.to_string(),
            state: JobState::Running,
            job: None,
            stopped: None,
        }),
    ))
}

/// POST /jobs/:id/stop
pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<StopJobResponse>> {
    let job = state.ingestion.job_status(&job_id).await?;
    if !state.ingestion.request_stop(&job_id).await {
        return Err(ApiError::Conflict(format!(
            "job '{}' is not running ({})",
            job_id,
            job.state.as_str()
        )));
    }
    Ok(Json(StopJobResponse {
        job_id,
        stop_requested: true,
    }))
}

/// GET /jobs/:id/dead-letters
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Vec<DeadLetterRecord>>> {
    state.ingestion.job_status(&job_id).await?;
    let letters = crate::db::dead_letters::find_by_job(&state.db, &job_id).await?;
    Ok(Json(letters))
}

/// POST /jobs/:id/replay
pub async fn replay_dead_letters(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<ReplayRequest>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state
        .ingestion
        .replay_dead_letters(&job_id, request.name.as_deref(), request.config)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// POST /jobs/:id/aliases
pub async fn register_alias(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(request): Json<AliasRequest>,
) -> ApiResult<(StatusCode, Json<AliasResponse>)> {
    if request.execution_job_id.trim().is_empty() {
        return Err(ApiError::BadRequest("execution_job_id is required".to_string()));
    }
    crate::db::aliases::register_alias(&state.db, &job_id, &request.execution_job_id)
        .await
        .map_err(PipelineError::from)?;

    tracing::info!(
        logical_job_id = %job_id,
        execution_job_id = %request.execution_job_id,
        "Job alias registered"
    );
    Ok((
        StatusCode::CREATED,
        Json(AliasResponse {
            logical_job_id: job_id,
            execution_job_id: request.execution_job_id,
        }),
    ))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(create_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/records", post(start_with_records))
        .route("/jobs/:id/file", post(start_with_file))
        .route("/jobs/:id/stop", post(stop_job))
        .route("/jobs/:id/dead-letters", get(list_dead_letters))
        .route("/jobs/:id/replay", post(replay_dead_letters))
        .route("/jobs/:id/aliases", post(register_alias))
}
