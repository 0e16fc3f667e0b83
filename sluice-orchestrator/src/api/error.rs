//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::service::job::JobError;
use crate::service::log::LogError;
use crate::service::pipeline::PipelineError;
use crate::store::StoreError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    StoreError(StoreError),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::StoreError(err) => {
                tracing::error!("Store error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::StoreError(err)
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound(name) => {
                ApiError::NotFound(format!("Pipeline {} not found", name))
            }
            PipelineError::AlreadyExists(name) => {
                ApiError::Conflict(format!("Pipeline {} already exists", name))
            }
            PipelineError::ValidationError(msg) => ApiError::BadRequest(msg),
            PipelineError::StoreError(err) => ApiError::StoreError(err),
            PipelineError::VfsError(err) if err.is_not_found() => {
                ApiError::BadRequest(err.to_string())
            }
            PipelineError::VfsError(err) => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            JobError::PipelineNotFound(name) => {
                ApiError::NotFound(format!("Pipeline {} not found", name))
            }
            JobError::NotRunning(id) => ApiError::BadRequest(format!("Job {} is not running", id)),
            JobError::ValidationError(msg) => ApiError::BadRequest(msg),
            JobError::StalePipeline(name) => {
                ApiError::Conflict(format!("Pipeline {} changed underneath", name))
            }
            JobError::StoreError(err) => ApiError::StoreError(err),
            JobError::VfsError(err) if err.is_not_found() => ApiError::BadRequest(err.to_string()),
            JobError::VfsError(err) => ApiError::InternalError(err.to_string()),
        }
    }
}

impl From<LogError> for ApiError {
    fn from(err: LogError) -> Self {
        match err {
            LogError::PipelineNotFound(name) => {
                ApiError::NotFound(format!("Pipeline {} not found", name))
            }
            LogError::JobNotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            LogError::ValidationError(msg) => ApiError::BadRequest(msg),
            LogError::CodecError(msg) => ApiError::InternalError(msg),
            LogError::StoreError(err) => ApiError::StoreError(err),
            LogError::ClusterError(err) => ApiError::InternalError(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
