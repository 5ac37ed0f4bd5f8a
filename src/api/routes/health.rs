//! Health Routes
//!
//! - GET /health - Liveness, 200 while the process is up
//! - GET /health/status - Hub counters

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::api::dto::HealthResponse;
use crate::api::state::AppState;

/// GET /health
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "WebSocket server is running")
}

/// GET /health/status
///
/// Always 200. Counters read as zero if the hub loop has stopped.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let (status, stats, subjects) = match (state.hub.stats().await, state.hub.subscribed_subjects().await) {
        (Ok(stats), Ok(subjects)) => ("ok", stats, subjects),
        _ => ("degraded", Default::default(), Vec::new()),
    };

    Json(HealthResponse {
        status: status.to_string(),
        connections: stats.connections,
        channels: stats.channels,
        subscriptions: stats.subscriptions,
        subscribed_subjects: subjects,
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
