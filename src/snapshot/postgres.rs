//! Postgres-backed business statistics
//!
//! Counts appointments (`citas`) for one business and renders them as a
//! [`Snapshot`].

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use super::{Snapshot, SnapshotError, SnapshotProvider};
use crate::config::DatabaseConfig;

// negocio_id is compared as text so both uuid and varchar keys bind from a string
const STATS_QUERY: &str = r#"
    SELECT
        COUNT(*) AS total_citas,
        COUNT(*) FILTER (WHERE fecha = CURRENT_DATE) AS citas_hoy,
        COUNT(*) FILTER (WHERE estado = 'atendida') AS citas_completadas,
        COUNT(*) FILTER (WHERE estado = 'cancelada') AS citas_canceladas
    FROM citas
    WHERE negocio_id::text = $1
"#;

/// Appointment counters for one business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct BusinessStats {
    pub total_citas: i64,
    pub citas_hoy: i64,
    pub citas_completadas: i64,
    pub citas_canceladas: i64,
}

impl BusinessStats {
    /// Render as the snapshot pushed to `stats` subscribers
    pub fn to_snapshot(&self, negocio_id: &str) -> Snapshot {
        let value = json!({
            "negocio_id": negocio_id,
            "citas_hoy": self.citas_hoy,
            "total_citas": self.total_citas,
            "citas_completadas": self.citas_completadas,
            "citas_canceladas": self.citas_canceladas,
            "timestamp": Utc::now().timestamp(),
        });
        match value {
            serde_json::Value::Object(map) => map,
            _ => Snapshot::new(),
        }
    }
}

/// Snapshot provider reading from the appointments database
#[derive(Clone)]
pub struct PgSnapshotProvider {
    pool: PgPool,
}

impl PgSnapshotProvider {
    /// Connect using `config`, retrying the initial connection
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, SnapshotError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| SnapshotError::Provider("database.url is not configured".into()))?;

        let attempts = config.connect_retries.max(1);
        let delay = Duration::from_secs(config.retry_delay_secs);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let options = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .max_lifetime(Duration::from_secs(config.max_lifetime_secs));

            match options.connect(url).await {
                Ok(pool) => {
                    tracing::info!(attempt, "Database connection established");
                    return Ok(Self { pool });
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(attempt, attempts, error = %e, "Database connection attempt failed");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(attempts, error = %e, "Giving up on database connection");
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn business_stats(&self, negocio_id: &str) -> Result<BusinessStats, SnapshotError> {
        let stats = sqlx::query_as::<_, BusinessStats>(STATS_QUERY)
            .bind(negocio_id)
            .fetch_one(&self.pool)
            .await?;

        tracing::debug!(
            negocio_id = %negocio_id,
            total = stats.total_citas,
            today = stats.citas_hoy,
            completed = stats.citas_completadas,
            cancelled = stats.citas_canceladas,
            "Loaded business stats"
        );
        Ok(stats)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SnapshotProvider for PgSnapshotProvider {
    async fn fetch_snapshot(&self, subject_id: &str) -> Result<Snapshot, SnapshotError> {
        let stats = self.business_stats(subject_id).await?;
        Ok(stats.to_snapshot(subject_id))
    }
}
