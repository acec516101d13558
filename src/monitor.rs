//! Optional lease monitor.
//!
//! Recovery of stuck units needs no background job: the claim predicate
//! already treats expired leases as claimable. This loop only makes them
//! visible, logging each owned unit found past its lease and counting it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::Result;
use crate::model::WorkUnit;
use crate::store::QueueStore;
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Max units reported per scan.
    pub limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            limit: 100,
        }
    }
}

pub struct LeaseMonitor {
    store: Arc<dyn QueueStore>,
    config: MonitorConfig,
}

impl LeaseMonitor {
    pub fn new(store: Arc<dyn QueueStore>, config: MonitorConfig) -> Self {
        Self { store, config }
    }

    /// One scan. Returns the units found past lease expiry.
    pub async fn scan(&self) -> Result<Vec<WorkUnit>> {
        let expired = self.store.expired_leases(self.config.limit).await?;
        let now = Utc::now();
        for unit in &expired {
            let overdue_secs = unit
                .lease_expires_at
                .map(|t| (now - t).num_seconds())
                .unwrap_or_default();
            warn!(
                unit_id = %unit.id,
                kind = %unit.kind,
                owner = unit.owner.as_deref().unwrap_or("-"),
                attempt = unit.attempt_count,
                overdue_secs,
                "unit stuck past lease expiry"
            );
            metrics::leases_expired().add(1, &[KeyValue::new("kind", unit.kind.clone())]);
        }
        Ok(expired)
    }

    /// Scan every `interval` until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "lease monitor started");
        loop {
            if let Err(e) = self.scan().await {
                warn!(error = %e, "lease scan failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("lease monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClaimOptions, MemoryStore};
    use serde_json::json;

    #[tokio::test]
    async fn scan_reports_only_expired_leases() {
        let store = Arc::new(MemoryStore::new());
        let short = ClaimOptions {
            lease_duration: Duration::from_millis(50),
            max_attempts: 3,
        };
        let long = ClaimOptions {
            lease_duration: Duration::from_secs(60),
            ..short
        };
        let stuck = store.enqueue("echo", json!({})).await.unwrap();
        store.enqueue("echo", json!({})).await.unwrap();
        store.enqueue("echo", json!({})).await.unwrap();
        store.claim("crashed", &short).await.unwrap().unit.unwrap();
        store.claim("alive", &long).await.unwrap().unit.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let monitor = LeaseMonitor::new(store, MonitorConfig::default());
        let found = monitor.scan().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stuck);
        assert_eq!(found[0].owner.as_deref(), Some("crashed"));
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let monitor = LeaseMonitor::new(
            Arc::new(MemoryStore::new()),
            MonitorConfig {
                interval: Duration::from_secs(3600),
                limit: 10,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
