//! Application State
//!
//! Shared state accessible by all HTTP handlers.
//! Wrapped in Arc for sharing across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::auth::Authenticator;
use crate::snapshot::SnapshotProvider;
use crate::websocket::HubHandle;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Entry point to the hub loop
    pub hub: HubHandle,
    /// Validates upgrade tokens
    pub auth: Arc<dyn Authenticator>,
    /// Statistics source for the trigger endpoint (optional)
    pub snapshots: Option<Arc<dyn SnapshotProvider>>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        hub: HubHandle,
        auth: Arc<dyn Authenticator>,
        snapshots: Option<Arc<dyn SnapshotProvider>>,
    ) -> Self {
        Self {
            hub,
            auth,
            snapshots,
            start_time: Instant::now(),
        }
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
