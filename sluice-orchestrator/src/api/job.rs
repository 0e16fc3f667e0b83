//! Job API Handlers
//!
//! HTTP endpoints for job management.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use uuid::Uuid;

use sluice_core::domain::job::JobInfo;
use sluice_core::dto::job::{
    CreateJobRequest, InspectJobQuery, JobList, ListJobQuery, RestartDatumRequest,
};

use crate::api::error::ApiResult;
use crate::scheduler::Orchestrator;
use crate::service::job_service;

/// POST /job/create
/// Create a job under a pipeline or as an orphan
pub async fn create_job(
    State(orch): State<Orchestrator>,
    Json(req): Json<CreateJobRequest>,
) -> ApiResult<Json<JobInfo>> {
    tracing::info!("Creating job");

    let job = job_service::create_job(&orch, req).await?;

    Ok(Json(job))
}

/// GET /job/list
/// List jobs, optionally restricted to one pipeline
pub async fn list_jobs(
    State(orch): State<Orchestrator>,
    Query(query): Query<ListJobQuery>,
) -> ApiResult<Json<JobList>> {
    tracing::debug!("Listing jobs");

    let jobs = job_service::list_job(&orch, query).await?;

    Ok(Json(JobList { jobs }))
}

/// GET /job/{id}
/// Get job by ID, blocking until terminal with `block`
pub async fn inspect_job(
    State(orch): State<Orchestrator>,
    Path(id): Path<Uuid>,
    Query(query): Query<InspectJobQuery>,
) -> ApiResult<Json<JobInfo>> {
    tracing::debug!("Getting job: {}", id);

    let job = job_service::inspect_job(&orch, id, query.block).await?;

    Ok(Json(job))
}

/// POST /job/{id}/stop
/// Stop a running job
pub async fn stop_job(
    State(orch): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<JobInfo>> {
    tracing::info!("Stopping job: {}", id);

    let job = job_service::stop_job(&orch, id).await?;

    Ok(Json(job))
}

/// POST /job/{id}/restart-datum
/// Re-process matching datums of a running job
pub async fn restart_datum(
    State(orch): State<Orchestrator>,
    Path(id): Path<Uuid>,
    Json(req): Json<RestartDatumRequest>,
) -> ApiResult<StatusCode> {
    tracing::info!("Restarting datums for job: {}", id);

    job_service::restart_datum(&orch, id, req).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /job/{id}
/// Delete a job record
pub async fn delete_job(
    State(orch): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Deleting job: {}", id);

    job_service::delete_job(&orch, id).await?;

    Ok(StatusCode::NO_CONTENT)
}
