//! Log API Handler
//!
//! HTTP endpoint for reading worker logs.

use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
};

use sluice_core::dto::log::GetLogsQuery;

use crate::api::error::{ApiError, ApiResult};
use crate::scheduler::Orchestrator;
use crate::service::log_service;

/// GET /logs
/// Stream filtered log lines for a pipeline or job as NDJSON
pub async fn get_logs(
    State(orch): State<Orchestrator>,
    Query(query): Query<GetLogsQuery>,
) -> ApiResult<impl IntoResponse> {
    tracing::debug!("Getting logs");

    let messages = log_service::get_logs(&orch, query).await?;

    let mut body = String::new();
    for msg in &messages {
        let line = serde_json::to_string(msg)
            .map_err(|e| ApiError::InternalError(format!("encoding log line: {e}")))?;
        body.push_str(&line);
        body.push('\n');
    }

    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body))
}
