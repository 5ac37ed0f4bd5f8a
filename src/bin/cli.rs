//! Queuecast CLI
//!
//! Command-line helpers for operating a Queuecast server:
//! - Issue development tokens
//! - Trigger statistics pushes
//! - Check server health
//! - Generate a config file

use clap::{Parser, Subcommand};
use queuecast::auth::JwtAuthenticator;
use queuecast::client::NotifyClient;
use queuecast::config::generate_default_config;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "queuecast-cli")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operate a Queuecast real-time hub")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Server URL
    #[arg(long, default_value = "http://localhost:8080", env = "QUEUECAST_URL", global = true)]
    pub server_url: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Issue a signed token for connecting to /ws
    Token {
        /// Identity placed in the user_id claim
        user_id: String,
        /// Role claim
        #[arg(short, long, default_value = "cliente")]
        role: String,
        /// Lifetime in minutes
        #[arg(short, long, default_value = "60")]
        ttl: i64,
        /// Signing secret
        #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
        secret: String,
    },

    /// Report an appointment change for a business
    Notify {
        /// Business ID
        negocio_id: String,
        /// Change kind (created, updated, cancelled, status_changed)
        #[arg(short, long, default_value = "updated")]
        action: String,
    },

    /// Show hub status
    Health,

    /// Generate default config file
    Init {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Token {
            user_id,
            role,
            ttl,
            secret,
        } => {
            let token = JwtAuthenticator::new(&secret).issue(&user_id, &role, token_ttl(ttl)?)?;
            println!("{}", token);
        }

        Commands::Notify { negocio_id, action } => {
            let client = NotifyClient::new(&cli.server_url)?;
            match client.notify_cita(&negocio_id, &action).await {
                Ok(message) => println!("{} (negocio {})", message.trim(), negocio_id),
                Err(e) => {
                    eprintln!("Notify failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Health => {
            let client = NotifyClient::new(&cli.server_url)?;
            match client.health().await {
                Ok(health) => {
                    println!("Queuecast v{}", health.version);
                    println!();
                    println!("Status: {}", health.status);
                    println!("  Connections:   {}", health.connections);
                    println!("  Channels:      {}", health.channels);
                    println!("  Subscriptions: {}", health.subscriptions);
                    if !health.subscribed_subjects.is_empty() {
                        println!(
                            "  Watched businesses: {}",
                            health.subscribed_subjects.join(", ")
                        );
                    }
                    println!();
                    println!("Uptime: {}", format_duration(health.uptime_seconds));
                }
                Err(e) => {
                    eprintln!("Cannot reach Queuecast at {}", cli.server_url);
                    eprintln!("Error: {}", e);
                    eprintln!();
                    eprintln!("Make sure the server is running:");
                    eprintln!("  cargo run --bin queuecast");
                    std::process::exit(1);
                }
            }
        }

        Commands::Init { output } => {
            let content = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, content)?;
                    println!("Config written to {:?}", path);
                }
                None => print!("{}", content),
            }
        }
    }

    Ok(())
}

fn token_ttl(minutes: i64) -> anyhow::Result<chrono::Duration> {
    if minutes <= 0 {
        anyhow::bail!("--ttl must be a positive number of minutes, got {}", minutes);
    }
    chrono::Duration::try_minutes(minutes)
        .ok_or_else(|| anyhow::anyhow!("--ttl of {} minutes is out of range", minutes))
}

fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    } else {
        format!("{}d {}h", seconds / 86400, (seconds % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ttl() {
        assert_eq!(token_ttl(15).unwrap(), chrono::Duration::minutes(15));
        assert!(token_ttl(0).is_err());
        assert!(token_ttl(-5).is_err());
        assert!(token_ttl(i64::MAX).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(3_700), "1h 1m");
        assert_eq!(format_duration(90_000), "1d 1h");
    }
}
