//! Error types for cdm-etl
//!
//! `PipelineError` is what services return. `ApiError` is its HTTP face.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::source_connector::ConnectorError;

/// Service-level errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid job configuration or illegal job transition (fatal for a job)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Source connector failed (fatal for a job)
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// Persistence found no records for the job in any store
    #[error("No records found for job '{job_id}' (checked: {})", stores_checked.join(", "))]
    NoRecordsFound {
        job_id: String,
        stores_checked: Vec<String>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Common(#[from] cdm_common::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. starting a job that already ran
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Persistence diagnostic (404 with the checked stores)
    #[error("No records found for job '{job_id}'")]
    NoRecordsFound {
        job_id: String,
        stores_checked: Vec<String>,
    },

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// cdm-common error
    #[error("Common error: {0}")]
    Common(#[from] cdm_common::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Configuration(msg) => ApiError::Conflict(msg),
            PipelineError::Connector(e) => ApiError::BadRequest(e.to_string()),
            PipelineError::NoRecordsFound { job_id, stores_checked } => {
                ApiError::NoRecordsFound { job_id, stores_checked }
            }
            PipelineError::InvalidInput(msg) => ApiError::BadRequest(msg),
            PipelineError::NotFound(msg) => ApiError::NotFound(msg),
            PipelineError::Common(cdm_common::Error::NotFound(msg)) => ApiError::NotFound(msg),
            PipelineError::Common(cdm_common::Error::InvalidInput(msg)) => ApiError::BadRequest(msg),
            PipelineError::Common(e) => ApiError::Common(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
            ApiError::NoRecordsFound { job_id, stores_checked } => {
                let body = Json(json!({
                    "error": {
                        "code": "NO_RECORDS_FOUND",
                        "message": format!(
                            "No records found for job '{}' in: {}",
                            job_id,
                            stores_checked.join(", ")
                        ),
                        "job_id": job_id,
                        "stores_checked": stores_checked,
                        "inserted": 0,
                    }
                }));
                return (StatusCode::NOT_FOUND, body).into_response();
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
