//! Health endpoint

use axum::Json;
use axum::response::IntoResponse;

/// GET /health
///
/// Liveness probe. Reports the running version; says nothing about
/// shard ownership or store reachability.
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
