//! Operator views over the compensation audit store

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Query, State},
};

use super::super::state::AppState;
use super::super::types::{
    ApiError, CompensationStatsView, CompensationView, ErrorBody, PendingQuery, StatsQuery,
};
use crate::compensation::DEFAULT_STATS_WINDOW;

const DEFAULT_PENDING_LIMIT: usize = 50;
const MAX_PENDING_LIMIT: usize = 500;

/// Compensations needing attention
///
/// Stale `pending` records plus `failed`, `timeout` and `manual_required`,
/// oldest first.
#[utoipa::path(
    get,
    path = "/compensations/pending",
    params(PendingQuery),
    responses(
        (status = 200, description = "Records needing attention", body = Vec<CompensationView>),
        (status = 500, description = "Audit store error", body = ErrorBody)
    ),
    tag = "Operations"
)]
pub async fn list_pending(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<CompensationView>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PENDING_LIMIT)
        .clamp(1, MAX_PENDING_LIMIT);
    let records = state.audits.pending(limit).await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// Compensation aggregates
#[utoipa::path(
    get,
    path = "/compensations/stats",
    params(StatsQuery),
    responses(
        (status = 200, description = "Counts by status over the window", body = CompensationStatsView),
        (status = 500, description = "Audit store error", body = ErrorBody)
    ),
    tag = "Operations"
)]
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<CompensationStatsView>, ApiError> {
    let window = query
        .window_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_STATS_WINDOW);
    let stats = state.audits.stats(window).await?;
    Ok(Json(stats.into()))
}
