//! Durable queue store: the single arbiter of work unit ownership.
//!
//! Workers never coordinate with each other directly. Every transition goes
//! through a [`QueueStore`], whose claim is atomic with respect to concurrent
//! claimers. [`PgStore`] does this with a locking read that skips locked rows;
//! [`MemoryStore`] does it with one mutex over the whole table.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{Error, Result};
use crate::model::{Lease, QueueStats, State, UnitId, WorkUnit};

/// Upper bound for lease durations and retry delays.
pub const MAX_DELAY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Parameters of a claim that come from pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClaimOptions {
    /// How long the claimer owns the unit before others may reclaim it.
    pub lease_duration: Duration,
    /// Expired-lease units at or above this attempt count are failed instead
    /// of handed out again.
    pub max_attempts: u32,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

/// Result of one [`QueueStore::claim`] call.
#[derive(Debug, Clone, Default)]
pub struct Claim {
    /// The unit now owned by the caller, if any was eligible.
    pub unit: Option<WorkUnit>,
    /// Owner of `unit` before this claim, when it was taken over from an
    /// expired lease.
    pub previous_owner: Option<String>,
    /// Expired-lease units failed by this call instead of being handed out.
    pub abandoned: Vec<Abandoned>,
}

/// An owned unit failed during a claim because its lease ran out on the
/// last allowed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned {
    pub id: UnitId,
    /// Worker whose lease expired.
    pub owner: String,
    pub attempt: u32,
    /// Recorded as the unit's `last_error`.
    pub error: String,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new `pending` unit.
    async fn enqueue(&self, kind: &str, payload: serde_json::Value) -> Result<UnitId>;

    /// Fetch a unit by id.
    async fn get(&self, id: UnitId) -> Result<WorkUnit>;

    /// Atomically take ownership of the oldest eligible unit.
    ///
    /// Eligible: `pending` and past `not_before`, or `owned` with an expired
    /// lease. Ordered by `created_at`, then `id`, across both predicates.
    /// `Claim::unit` is `None` when nothing is eligible. Expired-lease units
    /// that already used `max_attempts` are failed in the same call and
    /// reported in `Claim::abandoned`.
    async fn claim(&self, worker_id: &str, opts: &ClaimOptions) -> Result<Claim>;

    /// `owned -> completed`. Idempotent: a terminal unit yields `AlreadySettled`
    /// and keeps its original `settled_at`.
    async fn settle_completed(&self, lease: &Lease) -> Result<()>;

    /// `owned -> failed`, recording `error` as `last_error`.
    async fn settle_failed(&self, lease: &Lease, error: &str) -> Result<()>;

    /// `owned -> pending`, eligible again after `delay`. A `delay` above
    /// [`MAX_DELAY`] is a `Config` error and leaves the unit untouched.
    async fn requeue(&self, lease: &Lease, error: &str, delay: Duration) -> Result<()>;

    async fn count_by_state(&self, state: State) -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Owned units whose lease has run out, oldest first.
    async fn expired_leases(&self, limit: usize) -> Result<Vec<WorkUnit>>;

    async fn health_check(&self) -> Result<()>;
}

pub(crate) fn lease_expired_error(attempts: u32) -> String {
    format!(
        "lease expired after {attempts} attempt{}",
        if attempts == 1 { "" } else { "s" }
    )
}

/// Reject durations the stores cannot turn into a timestamp.
pub(crate) fn check_delay(what: &str, d: Duration) -> Result<()> {
    if d > MAX_DELAY {
        return Err(Error::Config(format!(
            "{what} of {}s exceeds the {}s limit",
            d.as_secs(),
            MAX_DELAY.as_secs()
        )));
    }
    Ok(())
}

/// `now + d`, or a `Config` error when the result is out of range.
pub(crate) fn after(now: DateTime<Utc>, what: &str, d: Duration) -> Result<DateTime<Utc>> {
    check_delay(what, d)?;
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| Error::Config(format!("{what} of {}s is out of range", d.as_secs())))
}
