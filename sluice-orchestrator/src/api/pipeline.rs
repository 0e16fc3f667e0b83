//! Pipeline API Handlers
//!
//! HTTP endpoints for pipeline management.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use sluice_core::domain::pipeline::PipelineInfo;
use sluice_core::dto::pipeline::{CreatePipelineRequest, DeletePipelineQuery, PipelineList};

use crate::api::error::ApiResult;
use crate::scheduler::Orchestrator;
use crate::service::pipeline_service;

/// POST /pipeline/create
/// Create a new pipeline, or update one with `update` set
pub async fn create_pipeline(
    State(orch): State<Orchestrator>,
    Json(req): Json<CreatePipelineRequest>,
) -> ApiResult<Json<PipelineInfo>> {
    tracing::info!("Creating pipeline: {}", req.name);

    let pipeline = pipeline_service::create_pipeline(&orch, req).await?;

    Ok(Json(pipeline))
}

/// GET /pipeline/list
/// List all pipelines
pub async fn list_pipelines(State(orch): State<Orchestrator>) -> ApiResult<Json<PipelineList>> {
    tracing::debug!("Listing all pipelines");

    let pipelines = pipeline_service::list_pipelines(&orch).await?;

    Ok(Json(PipelineList { pipelines }))
}

/// GET /pipeline/{name}
/// Get pipeline by name
pub async fn inspect_pipeline(
    State(orch): State<Orchestrator>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineInfo>> {
    tracing::debug!("Getting pipeline: {}", name);

    let pipeline = pipeline_service::inspect_pipeline(&orch, &name).await?;

    Ok(Json(pipeline))
}

/// POST /pipeline/{name}/start
/// Resume a stopped pipeline
pub async fn start_pipeline(
    State(orch): State<Orchestrator>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineInfo>> {
    tracing::info!("Starting pipeline: {}", name);

    let pipeline = pipeline_service::start_pipeline(&orch, &name).await?;

    Ok(Json(pipeline))
}

/// POST /pipeline/{name}/stop
/// Pause a pipeline
pub async fn stop_pipeline(
    State(orch): State<Orchestrator>,
    Path(name): Path<String>,
) -> ApiResult<Json<PipelineInfo>> {
    tracing::info!("Stopping pipeline: {}", name);

    let pipeline = pipeline_service::stop_pipeline(&orch, &name).await?;

    Ok(Json(pipeline))
}

/// DELETE /pipeline/{name}
/// Delete a pipeline
pub async fn delete_pipeline(
    State(orch): State<Orchestrator>,
    Path(name): Path<String>,
    Query(opts): Query<DeletePipelineQuery>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting pipeline: {}", name);

    pipeline_service::delete_pipeline(&orch, &name, opts).await?;

    Ok(StatusCode::NO_CONTENT)
}
