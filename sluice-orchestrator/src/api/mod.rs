//! API Module
//!
//! HTTP surface of the orchestrator, one submodule per resource.
//! Handlers stay thin: decode the request, call a service, map the
//! error onto a status code.

pub mod admin;
pub mod error;
pub mod health;
pub mod job;
pub mod log;
pub mod pipeline;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::scheduler::Orchestrator;

/// Create the main API router with all endpoints
pub fn create_router(orch: Orchestrator) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline endpoints
        .route("/pipeline/create", post(pipeline::create_pipeline))
        .route("/pipeline/list", get(pipeline::list_pipelines))
        .route("/pipeline/{name}", get(pipeline::inspect_pipeline))
        .route("/pipeline/{name}", delete(pipeline::delete_pipeline))
        .route("/pipeline/{name}/start", post(pipeline::start_pipeline))
        .route("/pipeline/{name}/stop", post(pipeline::stop_pipeline))
        // Job endpoints
        .route("/job/create", post(job::create_job))
        .route("/job/list", get(job::list_jobs))
        .route("/job/{id}", get(job::inspect_job))
        .route("/job/{id}", delete(job::delete_job))
        .route("/job/{id}/stop", post(job::stop_job))
        .route("/job/{id}/restart-datum", post(job::restart_datum))
        // Logs
        .route("/logs", get(log::get_logs))
        // Admin
        .route("/delete-all", post(admin::delete_all))
        // Add state and middleware
        .with_state(orch)
        .layer(TraceLayer::new_for_http())
}
