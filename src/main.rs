//! Queuecast Server
//!
//! Run with: cargo run --bin queuecast -- --config queuecast.toml
//!
//! Settings come from the config file (or the default locations) with
//! environment overrides; see `queuecast-cli init` for every key.
//! `RUST_LOG` takes precedence over `logging.level` when set.

use anyhow::Context;
use clap::Parser;
use queuecast::api::{serve, AppState};
use queuecast::auth::JwtAuthenticator;
use queuecast::config::{Config, LoggingConfig};
use queuecast::snapshot::{PgSnapshotProvider, SnapshotProvider};
use queuecast::websocket::Hub;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "queuecast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time fan-out hub for queue and appointment events")]
struct Args {
    /// Config file (default: searched in standard locations)
    #[arg(short, long, env = "QUEUECAST_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };

    init_tracing(&config.logging);
    tracing::info!("Starting Queuecast v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("invalid configuration")?;

    let secret = config.auth.jwt_secret.as_deref().unwrap_or_default();
    let auth = Arc::new(JwtAuthenticator::new(secret).with_leeway(config.auth.leeway_secs));

    let database = if config.database.url.is_some() {
        tracing::info!("Connecting to statistics database...");
        let provider = PgSnapshotProvider::connect(&config.database)
            .await
            .context("connecting to statistics database")?;
        Some(provider)
    } else {
        tracing::warn!("database.url not set; statistics snapshots are disabled");
        None
    };
    let snapshots = database
        .clone()
        .map(|provider| Arc::new(provider) as Arc<dyn SnapshotProvider>);

    let hub = Hub::spawn(config.hub.hub_config(), snapshots.clone());
    let state = AppState::new(hub, auth, snapshots);

    serve(state, &config.server).await?;

    if let Some(provider) = database {
        tracing::info!("Closing database pool...");
        provider.close().await;
    }
    tracing::info!("Queuecast stopped");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("queuecast={},tower_http={}", logging.level, logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
