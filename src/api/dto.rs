//! Data Transfer Objects
//!
//! Request and response types for the HTTP endpoints.

use serde::{Deserialize, Serialize};

/// Trigger sent by the REST service when appointments change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    /// Business whose statistics changed
    #[serde(default)]
    pub negocio_id: String,
    /// What happened: "created", "updated", "deleted", "status_changed"
    #[serde(default)]
    pub action: String,
}

/// Full health status
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub connections: usize,
    pub channels: usize,
    pub subscriptions: usize,
    pub subscribed_subjects: Vec<String>,
    pub uptime_seconds: u64,
    pub version: String,
}
