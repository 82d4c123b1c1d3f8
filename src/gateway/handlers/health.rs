//! Health check and metrics handlers

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, http::header, response::IntoResponse};
use utoipa::ToSchema;

use super::super::state::AppState;

/// Health check response data
#[derive(Debug, serde::Serialize, serde::Deserialize, ToSchema)]
pub struct HealthResponse {
    #[schema(example = "ok")]
    pub status: String,
    /// Sagas with a live run on this node
    pub running_sagas: usize,
    #[schema(example = "0.1.0")]
    pub version: String,
    #[schema(example = "a1b2c3d")]
    pub git_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Health check endpoint
///
/// Pings the engine over RPC; the engine checks the saga store, audit store
/// and ledger participant.
///
/// - Healthy: 200 OK
/// - Unhealthy: 503 Service Unavailable
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse, content_type = "application/json"),
        (status = 503, description = "Service unavailable", body = HealthResponse)
    ),
    tag = "System"
)]
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let (serving, running_sagas, detail) = match state.orchestrator.health().await {
        Ok(h) => (h.serving, h.running_sagas, h.detail),
        Err(e) => (false, 0, Some(e.to_string())),
    };

    if !serving {
        tracing::error!(detail = ?detail, "[HEALTH] engine not serving");
    }

    let status = if serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            status: if serving { "ok" } else { "unavailable" }.to_string(),
            running_sagas,
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_hash: env!("GIT_HASH").to_string(),
            detail,
        }),
    )
}

/// Text exposition of saga counters
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "name{labels} value lines", body = String, content_type = "text/plain")
    ),
    tag = "System"
)]
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
