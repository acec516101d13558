//! Retry/backoff policy: decides a failed unit's fate.

use std::time::Duration;

use crate::model::WorkUnit;

/// Delay before a requeued unit becomes claimable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Eligible again immediately.
    None,
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for Backoff {
    /// 10s, 20s, 40s, ... up to five minutes.
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay after the `attempt`-th failed attempt (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
            }
        }
    }
}

/// Outcome of [`RetryPolicy::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Back to `pending`, claimable after `delay`.
    Requeue { delay: Duration },
    /// Terminal `failed`.
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Claims allowed before a failing unit is abandoned.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Decide what happens to `unit` after its handler failed.
    ///
    /// `attempt_count` already includes the attempt that just failed.
    pub fn on_failure(&self, unit: &WorkUnit) -> Decision {
        if unit.attempt_count < self.max_attempts {
            Decision::Requeue {
                delay: self.backoff.delay(unit.attempt_count),
            }
        } else {
            Decision::Abandon
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{State, UnitId};
    use chrono::Utc;

    fn unit(attempt_count: u32) -> WorkUnit {
        WorkUnit {
            id: UnitId(1),
            kind: "echo".into(),
            payload: serde_json::Value::Null,
            state: State::Owned,
            owner: Some("w".into()),
            lease_expires_at: None,
            attempt_count,
            last_error: None,
            not_before: None,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    #[test]
    fn default_backoff_doubles_from_ten_seconds() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Duration::from_secs(10));
        assert_eq!(b.delay(2), Duration::from_secs(20));
        assert_eq!(b.delay(3), Duration::from_secs(40));
    }

    #[test]
    fn backoff_is_capped() {
        let b = Backoff::default();
        assert_eq!(b.delay(6), Duration::from_secs(300));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn requeues_below_max_attempts_and_abandons_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.on_failure(&unit(1)),
            Decision::Requeue {
                delay: Duration::from_secs(10)
            }
        );
        assert!(matches!(policy.on_failure(&unit(2)), Decision::Requeue { .. }));
        assert_eq!(policy.on_failure(&unit(3)), Decision::Abandon);
        assert_eq!(policy.on_failure(&unit(4)), Decision::Abandon);
    }

    #[test]
    fn no_backoff_requeues_immediately() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::None,
        };
        assert_eq!(
            policy.on_failure(&unit(4)),
            Decision::Requeue {
                delay: Duration::ZERO
            }
        );
    }
}
