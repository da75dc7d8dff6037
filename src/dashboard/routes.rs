//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is the engine's shared `StatusBoard`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::engine::status::{EngineState, ListingStatus, StatusBoard};
use crate::engine::RoundReport;

pub type AppState = Arc<StatusBoard>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub state: EngineState,
    pub round: u64,
    pub listings_tracked: usize,
    pub uptime_secs: i64,
    pub last_round: Option<RoundReport>,
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let engine = state.engine().await;
    Json(StatusResponse {
        state: engine.state,
        round: engine.round,
        listings_tracked: engine.listings_tracked,
        uptime_secs: (chrono::Utc::now() - engine.started_at).num_seconds(),
        last_round: state.last_round().await,
    })
}

/// GET /api/listings
pub async fn get_listings(State(state): State<AppState>) -> Json<Vec<ListingStatus>> {
    Json(state.listings().await)
}

/// GET /api/listings/:id
pub async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ListingStatus>, StatusCode> {
    state.listing(id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/rounds
pub async fn get_rounds(State(state): State<AppState>) -> Json<Vec<RoundReport>> {
    Json(state.rounds().await)
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}
