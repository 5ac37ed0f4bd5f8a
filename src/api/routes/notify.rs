//! Trigger Route
//!
//! - POST /notify/cita - A producer reports that a business's appointments
//!   changed. The latest statistics are fetched and pushed to everyone
//!   subscribed to that business's stats channel.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::api::dto::NotifyRequest;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::snapshot::fetch_with_timeout;
use crate::websocket::{stats_channel, Envelope};

/// POST /notify/cita
pub async fn notify_cita(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NotifyRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, &'static str)> {
    let Json(req) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;

    tracing::info!(negocio_id = %req.negocio_id, action = %req.action, "Notification received");

    if req.negocio_id.is_empty() {
        return Err(ApiError::Validation("negocio_id is required".to_string()));
    }

    let provider = state.snapshots.as_ref().ok_or_else(|| {
        ApiError::ServiceUnavailable("statistics source not configured".to_string())
    })?;

    let deadline = state.hub.config().snapshot_timeout;
    let snapshot = fetch_with_timeout(provider.as_ref(), &req.negocio_id, deadline).await?;

    let channel = stats_channel(&req.negocio_id);
    let frame = Envelope::stats(&channel, &req.negocio_id, snapshot)
        .to_frame()
        .map_err(|e| ApiError::Internal(format!("Failed to encode stats: {}", e)))?;

    tracing::debug!(channel = %channel, bytes = frame.len(), "Publishing stats update");
    state.hub.broadcast_to_channel(channel, frame).await?;

    tracing::info!(negocio_id = %req.negocio_id, action = %req.action, "Stats update published");
    Ok((StatusCode::OK, "Notification processed"))
}
