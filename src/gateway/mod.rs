//! HTTP Gateway
//!
//! axum front door for the transfer orchestrator plus operator views over
//! the compensation audit store.

pub mod handlers;
pub mod openapi;
pub mod state;
pub mod types;

use std::sync::Arc;

use axum::{
    Json, Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use utoipa::OpenApi;

use crate::config::GatewayConfig;
use openapi::ApiDoc;
use state::AppState;

/// Gateway routes
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/transfer", post(handlers::create_transfer))
        .route("/transfer/{transaction_id}", get(handlers::get_transfer))
        .route(
            "/transfer/{transaction_id}/cancel",
            post(handlers::cancel_transfer),
        )
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/compensations/pending", get(handlers::list_pending))
        .route("/compensations/stats", get(handlers::get_stats))
        .route(
            "/api-docs/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .with_state(state)
}

/// Bind and serve until the listener fails
pub async fn run_server(config: &GatewayConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Gateway listening on http://{}", addr);
    tracing::info!("OpenAPI JSON at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
