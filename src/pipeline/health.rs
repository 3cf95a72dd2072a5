//! Liveness state exposed to collaborators
//!
//! Updated once per cycle by the scheduler; readable in-process through
//! `HealthHandle::snapshot` and published as JSON to `kv_store`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// kv_store key holding the serialized snapshot
pub const HEALTH_KEY: &str = "pipeline_health";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Start time of the most recent completed cycle
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Most recent cycle with at least one successful task
    pub last_success_at: Option<DateTime<Utc>>,
    /// Failed tasks in the most recent cycle
    pub failed_tasks: usize,
    /// One line per failed task, `kind exchange:pair: error`; aborted
    /// tasks count in `failed_tasks` without a line
    pub errors: Vec<String>,
}

#[derive(Clone, Default)]
pub struct HealthHandle {
    inner: Arc<RwLock<HealthSnapshot>>,
}

impl HealthHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        self.inner.read().await.clone()
    }

    /// Fold one cycle's outcome into the snapshot and return the new value
    pub async fn record(
        &self,
        cycle_at: DateTime<Utc>,
        succeeded: usize,
        failed: usize,
        errors: Vec<String>,
    ) -> HealthSnapshot {
        let mut state = self.inner.write().await;
        state.last_cycle_at = Some(cycle_at);
        if succeeded > 0 {
            state.last_success_at = Some(cycle_at);
        }
        state.failed_tasks = failed;
        state.errors = errors;
        state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ts_from_secs;

    #[tokio::test]
    async fn test_record_keeps_last_success() {
        let health = HealthHandle::new();
        assert_eq!(health.snapshot().await, HealthSnapshot::default());

        let first = ts_from_secs(3600).unwrap();
        health.record(first, 10, 0, vec![]).await;

        let second = ts_from_secs(7200).unwrap();
        let snap = health
            .record(second, 0, 1, vec!["candle binance:BTC/USDT: adapter unavailable: 503".into()])
            .await;

        assert_eq!(snap.last_cycle_at, Some(second));
        assert_eq!(snap.last_success_at, Some(first));
        assert_eq!(snap.failed_tasks, 1);
        assert_eq!(health.snapshot().await, snap);
    }

    #[test]
    fn test_snapshot_json_shape() {
        let snap = HealthSnapshot {
            last_cycle_at: ts_from_secs(0),
            last_success_at: None,
            failed_tasks: 0,
            errors: vec![],
        };
        let json: serde_json::Value = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["last_cycle_at"], "1970-01-01T00:00:00Z");
        assert!(json["last_success_at"].is_null());
    }
}
