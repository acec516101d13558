//! Core data model.
//!
//! A work unit is one inbound event waiting to be processed exactly once.
//! It carries an opaque payload, a `kind` that selects its handler, and the
//! ownership/lease fields the claim protocol uses to arbitrate between workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Unit
// ---------------------------------------------------------------------------

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Monotonically increasing identifier. Tie-break for FIFO ordering.
    pub id: UnitId,

    /// Payload schema tag. Selects the handler.
    pub kind: String,

    /// Passed unmodified to the handler. The queue never interprets it.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub state: State,

    /// Worker holding the unit. Only set while `state == Owned`.
    pub owner: Option<String>,

    /// After this instant an owned unit may be reclaimed by any worker.
    /// Only set while `state == Owned`.
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Number of times the unit has been claimed.
    pub attempt_count: u32,

    /// Last failure detail.
    pub last_error: Option<String>,

    /// Pending units are not eligible for claim before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// The claim receipt for this unit, if it is currently owned.
    pub fn lease(&self) -> Option<Lease> {
        match (self.state, &self.owner) {
            (State::Owned, Some(owner)) => Some(Lease {
                unit_id: self.id,
                worker_id: owner.clone(),
                attempt: self.attempt_count,
            }),
            _ => None,
        }
    }

    /// Owned with a lease that ran out before `now`.
    pub fn lease_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == State::Owned && self.lease_expires_at.is_some_and(|t| t < now)
    }
}

/// Newtype for work unit IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub i64);

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UnitId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse()
            .map(UnitId)
            .map_err(|_| Error::Other(format!("invalid unit id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker under a lease.
    Owned,
    /// Handled successfully. Terminal.
    Completed,
    /// Exhausted retries or unroutable. Terminal.
    Failed,
}

impl State {
    pub const ALL: [State; 4] = [State::Pending, State::Owned, State::Completed, State::Failed];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Pending, Owned)
                // expired lease reclaimed
                | (Owned, Owned)
                // retry
                | (Owned, Pending)
                | (Owned, Completed)
                | (Owned, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Owned => "owned",
            State::Completed => "completed",
            State::Failed => "failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(State::Pending),
            "owned" => Ok(State::Owned),
            "completed" => Ok(State::Completed),
            "failed" => Ok(State::Failed),
            _ => Err(Error::Other(format!("unknown state: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

/// Proof of a claim. Settle calls must present it.
///
/// `attempt` is the unit's `attempt_count` at claim time and acts as a fencing
/// token: once another worker reclaims the unit the count moves on and the old
/// lease is rejected with [`Error::LeaseLost`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub unit_id: UnitId,
    pub worker_id: String,
    pub attempt: u32,
}

impl Lease {
    pub(crate) fn lost(&self) -> Error {
        Error::LeaseLost {
            id: self.unit_id,
            worker_id: self.worker_id.clone(),
            attempt: self.attempt,
        }
    }

    /// Error for a settle call that matched no owned row, given the row's current state.
    pub(crate) fn rejection(&self, current: Option<State>) -> Error {
        match current {
            None => Error::NotFound(self.unit_id),
            Some(state) if state.is_terminal() => Error::AlreadySettled(self.unit_id),
            Some(_) => self.lost(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Snapshot of queue depth by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub owned: u64,
    pub completed: u64,
    pub failed: u64,
    /// Owned units whose lease has already run out.
    pub expired_leases: u64,
}

impl QueueStats {
    pub fn get(&self, state: State) -> u64 {
        match state {
            State::Pending => self.pending,
            State::Owned => self.owned,
            State::Completed => self.completed,
            State::Failed => self.failed,
        }
    }

    pub(crate) fn bump(&mut self, state: State, n: u64) {
        match state {
            State::Pending => self.pending += n,
            State::Owned => self.owned += n,
            State::Completed => self.completed += n,
            State::Failed => self.failed += n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_never_transition() {
        for from in [State::Completed, State::Failed] {
            for to in State::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in State::ALL {
            assert_eq!(state.as_str().parse::<State>().unwrap(), state);
        }
        assert!("dead".parse::<State>().is_err());
    }

    #[test]
    fn rejection_maps_current_state() {
        let lease = Lease {
            unit_id: UnitId(7),
            worker_id: "w".into(),
            attempt: 1,
        };
        assert!(matches!(lease.rejection(None), Error::NotFound(UnitId(7))));
        assert!(matches!(
            lease.rejection(Some(State::Completed)),
            Error::AlreadySettled(_)
        ));
        assert!(matches!(
            lease.rejection(Some(State::Pending)),
            Error::LeaseLost { attempt: 1, .. }
        ));
    }
}
