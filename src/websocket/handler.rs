//! WebSocket Handler
//!
//! Authenticates the upgrade request and hands the socket to a connection
//! agent. A request whose token fails authentication is rejected with 401
//! and never reaches the hub.

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::sync::Arc;

use super::connection;
use crate::api::{ApiError, AppState};

/// Query string of the upgrade request
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws?token=...
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ConnectParams>, QueryRejection>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::Validation(e.body_text()))?;
    let token = params.token.unwrap_or_default();

    let identity = state.auth.authenticate(&token).map_err(|e| {
        tracing::info!(error = %e, "Connection rejected");
        ApiError::Unauthorized(e.to_string())
    })?;

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    tracing::info!(identity = %identity, "Client connected");
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| connection::serve(socket, identity, hub)))
}
