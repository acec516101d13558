//! In-memory queue store.
//!
//! Same contract as the Postgres store with a single mutex standing in for
//! row locks: every operation holds the lock for its whole read-modify-write,
//! so concurrent claimers serialize and each sees the previous one's result.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use super::{Abandoned, Claim, ClaimOptions, QueueStore, after, lease_expired_error};
use crate::error::{Error, Result};
use crate::model::{Lease, QueueStats, State, UnitId, WorkUnit};
use crate::telemetry::metrics;

#[derive(Default)]
struct Table {
    next_id: i64,
    units: BTreeMap<UnitId, WorkUnit>,
}

impl Table {
    /// The owned row matching `lease`, or the reason there is none.
    fn leased_mut(&mut self, lease: &Lease) -> Result<&mut WorkUnit> {
        let current = self.units.get(&lease.unit_id).map(|u| u.state);
        match self.units.get_mut(&lease.unit_id) {
            Some(unit)
                if unit.state == State::Owned
                    && unit.owner.as_deref() == Some(lease.worker_id.as_str())
                    && unit.attempt_count == lease.attempt =>
            {
                Ok(unit)
            }
            _ => Err(lease.rejection(current)),
        }
    }
}

/// Queue store held entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|_| Error::store("memory store mutex poisoned"))
    }
}

fn clear_lease(unit: &mut WorkUnit) {
    unit.owner = None;
    unit.lease_expires_at = None;
}

fn settle(unit: &mut WorkUnit, state: State, now: DateTime<Utc>) {
    unit.state = state;
    unit.settled_at = Some(now);
    clear_lease(unit);
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<UnitId> {
        let mut table = self.lock()?;
        table.next_id += 1;
        let id = UnitId(table.next_id);
        table.units.insert(
            id,
            WorkUnit {
                id,
                kind: kind.to_string(),
                payload,
                state: State::Pending,
                owner: None,
                lease_expires_at: None,
                attempt_count: 0,
                last_error: None,
                not_before: None,
                created_at: Utc::now(),
                settled_at: None,
            },
        );
        drop(table);

        metrics::units_enqueued().add(1, &[opentelemetry::KeyValue::new("kind", kind.to_string())]);
        Ok(id)
    }

    async fn get(&self, id: UnitId) -> Result<WorkUnit> {
        self.lock()?.units.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    async fn claim(&self, worker_id: &str, opts: &ClaimOptions) -> Result<Claim> {
        let now = Utc::now();
        let lease_expires_at = after(now, "lease duration", opts.lease_duration)?;
        let mut table = self.lock()?;
        let mut claim = Claim::default();

        // Expired leases that already used every attempt are settled, not reclaimed.
        for unit in table.units.values_mut() {
            if unit.lease_expired_at(now) && unit.attempt_count >= opts.max_attempts {
                let error = lease_expired_error(unit.attempt_count);
                warn!(id = %unit.id, attempts = unit.attempt_count, "abandoning unit with expired lease");
                claim.abandoned.push(Abandoned {
                    id: unit.id,
                    owner: unit.owner.clone().unwrap_or_default(),
                    attempt: unit.attempt_count,
                    error: error.clone(),
                });
                unit.last_error = Some(error);
                settle(unit, State::Failed, now);
            }
        }

        let candidate = table
            .units
            .values()
            .filter(|u| match u.state {
                State::Pending => u.not_before.is_none_or(|t| t <= now),
                State::Owned => u.lease_expired_at(now),
                _ => false,
            })
            .min_by_key(|u| (u.created_at, u.id))
            .map(|u| u.id);

        if let Some(unit) = candidate.and_then(|id| table.units.get_mut(&id)) {
            claim.previous_owner = unit.owner.take();
            unit.state = State::Owned;
            unit.owner = Some(worker_id.to_string());
            unit.lease_expires_at = Some(lease_expires_at);
            unit.attempt_count += 1;
            unit.not_before = None;
            claim.unit = Some(unit.clone());
        }
        Ok(claim)
    }

    async fn settle_completed(&self, lease: &Lease) -> Result<()> {
        let mut table = self.lock()?;
        let unit = table.leased_mut(lease)?;
        settle(unit, State::Completed, Utc::now());
        Ok(())
    }

    async fn settle_failed(&self, lease: &Lease, error: &str) -> Result<()> {
        let mut table = self.lock()?;
        let unit = table.leased_mut(lease)?;
        unit.last_error = Some(error.to_string());
        settle(unit, State::Failed, Utc::now());
        Ok(())
    }

    async fn requeue(&self, lease: &Lease, error: &str, delay: Duration) -> Result<()> {
        let not_before = after(Utc::now(), "retry delay", delay)?;
        let mut table = self.lock()?;
        let unit = table.leased_mut(lease)?;
        unit.state = State::Pending;
        unit.last_error = Some(error.to_string());
        unit.not_before = Some(not_before);
        clear_lease(unit);
        Ok(())
    }

    async fn count_by_state(&self, state: State) -> Result<u64> {
        Ok(self.lock()?.units.values().filter(|u| u.state == state).count() as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = Utc::now();
        let table = self.lock()?;
        let mut stats = QueueStats::default();
        for unit in table.units.values() {
            stats.bump(unit.state, 1);
            if unit.lease_expired_at(now) {
                stats.expired_leases += 1;
            }
        }
        Ok(stats)
    }

    async fn expired_leases(&self, limit: usize) -> Result<Vec<WorkUnit>> {
        let now = Utc::now();
        let table = self.lock()?;
        let mut expired: Vec<WorkUnit> = table
            .units
            .values()
            .filter(|u| u.lease_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|u| (u.lease_expires_at, u.id));
        expired.truncate(limit);
        Ok(expired)
    }

    async fn health_check(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts() -> ClaimOptions {
        ClaimOptions {
            lease_duration: Duration::from_secs(60),
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let store = MemoryStore::new();
        let a = store.enqueue("echo", json!({})).await.unwrap();
        let b = store.enqueue("echo", json!({})).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn requeue_with_delay_hides_unit_until_not_before() {
        let store = MemoryStore::new();
        store.enqueue("echo", json!({})).await.unwrap();

        let unit = store.claim("w1", &opts()).await.unwrap().unit.unwrap();
        let lease = unit.lease().unwrap();
        store
            .requeue(&lease, "boom", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(store.claim("w1", &opts()).await.unwrap().unit.is_none());
        let unit = store.get(unit.id).await.unwrap();
        assert_eq!(unit.state, State::Pending);
        assert_eq!(unit.last_error.as_deref(), Some("boom"));
        assert!(unit.owner.is_none());
        assert!(unit.lease_expires_at.is_none());
    }

    #[tokio::test]
    async fn requeue_twice_with_same_lease_is_rejected() {
        let store = MemoryStore::new();
        store.enqueue("echo", json!({})).await.unwrap();
        let lease = store
            .claim("w1", &opts())
            .await
            .unwrap()
            .unit
            .unwrap()
            .lease()
            .unwrap();

        store.requeue(&lease, "boom", Duration::ZERO).await.unwrap();
        let err = store.requeue(&lease, "boom", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn settle_unknown_unit_is_not_found() {
        let store = MemoryStore::new();
        let lease = Lease {
            unit_id: UnitId(99),
            worker_id: "w1".into(),
            attempt: 1,
        };
        let err = store.settle_completed(&lease).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(UnitId(99))));
    }

    #[tokio::test]
    async fn oversized_lease_is_rejected_without_poisoning_the_table() {
        let store = MemoryStore::new();
        let id = store.enqueue("echo", json!({})).await.unwrap();

        let huge = ClaimOptions {
            lease_duration: Duration::from_secs(10_000_000_000_000),
            max_attempts: 3,
        };
        let err = store.claim("w1", &huge).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert_eq!(store.get(id).await.unwrap().state, State::Pending);

        let unit = store.claim("w1", &opts()).await.unwrap().unit.unwrap();
        assert_eq!(unit.id, id);
        assert_eq!(unit.attempt_count, 1);
    }

    #[tokio::test]
    async fn oversized_retry_delay_leaves_unit_owned() {
        let store = MemoryStore::new();
        store.enqueue("echo", json!({})).await.unwrap();
        let unit = store.claim("w1", &opts()).await.unwrap().unit.unwrap();
        let lease = unit.lease().unwrap();

        let err = store
            .requeue(&lease, "boom", Duration::from_secs(u64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert_eq!(store.get(unit.id).await.unwrap().state, State::Owned);
        store.settle_completed(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn claim_reports_reclaimed_and_abandoned_units() {
        let store = MemoryStore::new();
        let short = ClaimOptions {
            lease_duration: Duration::from_millis(30),
            max_attempts: 2,
        };
        let first = store.enqueue("echo", json!({})).await.unwrap();

        let claim = store.claim("w1", &short).await.unwrap();
        assert!(claim.previous_owner.is_none());
        assert!(claim.abandoned.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let claim = store.claim("w2", &short).await.unwrap();
        assert_eq!(claim.unit.unwrap().id, first);
        assert_eq!(claim.previous_owner.as_deref(), Some("w1"));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let claim = store.claim("w3", &short).await.unwrap();
        assert!(claim.unit.is_none());
        assert_eq!(
            claim.abandoned,
            vec![Abandoned {
                id: first,
                owner: "w2".into(),
                attempt: 2,
                error: "lease expired after 2 attempts".into(),
            }]
        );
    }
}
