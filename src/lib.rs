//! # Queuecast
//!
//! Real-time fan-out hub for a queue and appointment system. Authenticated
//! WebSocket clients subscribe to named channels; producers push JSON events
//! to every connection, to one channel, or as raw legacy frames.
//!
//! ## Modules
//!
//! - [`websocket`]: Hub actor, per-connection mailboxes and the upgrade handler
//! - [`auth`]: Bearer token validation and identity extraction
//! - [`snapshot`]: Statistics snapshots sent when a stats channel is joined
//! - [`api`]: HTTP server with Axum
//! - [`client`]: HTTP client for producers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use queuecast::{Envelope, Hub, HubConfig, MessageKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hub = Hub::spawn(HubConfig::default(), None);
//!
//!     let event = Envelope::new(
//!         MessageKind::from("avance_fila".to_string()),
//!         serde_json::json!({"posicion": 3}),
//!     )
//!     .with_channel("fila:7");
//!     hub.broadcast_to_channel("fila:7", event.to_frame()?).await?;
//!
//!     println!("{:?}", hub.stats().await?);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod snapshot;
pub mod websocket;

pub use api::{build_router, serve, ApiError, AppState};

pub use auth::{AuthError, Authenticator, Identity, JwtAuthenticator};

pub use client::{ClientError, NotifyClient};

pub use config::{Config, ConfigError, LoggingConfig};

pub use snapshot::{PgSnapshotProvider, Snapshot, SnapshotError, SnapshotProvider};

pub use websocket::{
    stats_channel, ConnectionHandle, ConnectionId, DomainEvent, Envelope, Frame, Hub, HubConfig,
    HubError, HubHandle, HubStats, MessageKind,
};
