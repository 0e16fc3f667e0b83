//! Admin API Handlers
//!
//! Cluster-wide maintenance endpoints.

use axum::{extract::State, http::StatusCode};

use crate::api::error::ApiResult;
use crate::scheduler::Orchestrator;
use crate::service::pipeline_service;

/// POST /delete-all
/// Delete every pipeline and job
pub async fn delete_all(State(orch): State<Orchestrator>) -> ApiResult<StatusCode> {
    tracing::info!("Deleting all pipelines and jobs");

    pipeline_service::delete_all(&orch).await?;

    Ok(StatusCode::NO_CONTENT)
}
