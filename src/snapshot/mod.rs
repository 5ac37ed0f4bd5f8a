//! Snapshot Provider
//!
//! Supplies point-in-time aggregates for a subject (a business). The hub asks
//! for one when a client subscribes to a stats channel, and the trigger
//! endpoint asks for one each time a producer reports a change.
//!
//! Providers never apply their own deadline or retry; callers wrap
//! [`SnapshotProvider::fetch_snapshot`] in `tokio::time::timeout`.

mod postgres;

pub use postgres::{BusinessStats, PgSnapshotProvider};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Field → value mapping delivered as the `data` of a `stats` message
pub type Snapshot = Map<String, Value>;

/// Read-only source of snapshots
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn fetch_snapshot(&self, subject_id: &str) -> Result<Snapshot, SnapshotError>;
}

/// Errors that can occur while fetching a snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Snapshot fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Snapshot provider error: {0}")]
    Provider(String),
}

/// Fetch with a deadline, folding the elapsed case into [`SnapshotError::Timeout`]
pub async fn fetch_with_timeout(
    provider: &dyn SnapshotProvider,
    subject_id: &str,
    deadline: Duration,
) -> Result<Snapshot, SnapshotError> {
    match tokio::time::timeout(deadline, provider.fetch_snapshot(subject_id)).await {
        Ok(result) => result,
        Err(_) => Err(SnapshotError::Timeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Slow;

    #[async_trait]
    impl SnapshotProvider for Slow {
        async fn fetch_snapshot(&self, _subject_id: &str) -> Result<Snapshot, SnapshotError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Snapshot::new())
        }
    }

    struct Fixed;

    #[async_trait]
    impl SnapshotProvider for Fixed {
        async fn fetch_snapshot(&self, subject_id: &str) -> Result<Snapshot, SnapshotError> {
            let mut snapshot = Snapshot::new();
            snapshot.insert("negocio_id".into(), json!(subject_id));
            Ok(snapshot)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out() {
        let err = fetch_with_timeout(&Slow, "biz1", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_fetch_passes_through() {
        let snapshot = fetch_with_timeout(&Fixed, "biz1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(snapshot["negocio_id"], "biz1");
    }
}
