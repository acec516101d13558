//! Structured events emitted by the worker pool on every state transition.
//!
//! Each event is logged through `tracing`, counted in metrics and broadcast to
//! in-process subscribers. Subscribers that fall behind lose the oldest events;
//! the store remains the source of truth.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::UnitId;
use crate::telemetry::metrics;

/// A structured event emitted by the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    pub unit_id: UnitId,
    pub worker_id: String,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Claimed {
        attempt: u32,
        lease_expires_at: Option<DateTime<Utc>>,
        /// Set when the unit was taken over from this worker's expired lease.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_owner: Option<String>,
    },
    Completed {
        attempt: u32,
        duration_ms: u64,
    },
    Requeued {
        attempt: u32,
        error: String,
        not_before: DateTime<Utc>,
    },
    Failed {
        attempt: u32,
        error: String,
    },
}

impl EventKind {
    /// Transition name, as used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Claimed { .. } => "claimed",
            EventKind::Completed { .. } => "completed",
            EventKind::Requeued { .. } => "requeued",
            EventKind::Failed { .. } => "failed",
        }
    }

    fn transition(&self) -> (&'static str, &'static str) {
        match self {
            EventKind::Claimed {
                previous_owner: Some(_),
                ..
            } => ("owned", "owned"),
            EventKind::Claimed { .. } => ("pending", "owned"),
            EventKind::Completed { .. } => ("owned", "completed"),
            EventKind::Requeued { .. } => ("owned", "pending"),
            EventKind::Failed { .. } => ("owned", "failed"),
        }
    }
}

/// Fan-out point for pool events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Log, count and broadcast one transition.
    pub fn emit(&self, unit_id: UnitId, worker_id: &str, kind: EventKind) {
        let event = Event {
            timestamp: Utc::now(),
            unit_id,
            worker_id: worker_id.to_string(),
            kind,
        };

        match &event.kind {
            EventKind::Requeued { error, not_before, attempt } => warn!(
                event = event.kind.name(),
                unit_id = %unit_id,
                worker_id,
                attempt,
                %not_before,
                error = error.as_str(),
                "unit requeued"
            ),
            EventKind::Claimed {
                previous_owner: Some(previous_owner),
                attempt,
                ..
            } => warn!(
                event = event.kind.name(),
                unit_id = %unit_id,
                worker_id,
                attempt,
                previous_owner = previous_owner.as_str(),
                "unit reclaimed from expired lease"
            ),
            EventKind::Failed { error, attempt } => warn!(
                event = event.kind.name(),
                unit_id = %unit_id,
                worker_id,
                attempt,
                error = error.as_str(),
                "unit failed permanently"
            ),
            _ => info!(
                event = event.kind.name(),
                unit_id = %unit_id,
                worker_id,
                timestamp = %event.timestamp,
                "unit {}",
                event.kind.name()
            ),
        }

        let (from, to) = event.kind.transition();
        metrics::unit_transitions().add(1, &[KeyValue::new("from", from), KeyValue::new("to", to)]);

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
