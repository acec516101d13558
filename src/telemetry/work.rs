//! Unit execution span helpers.

use tracing::Span;

use crate::model::WorkUnit;

/// Start a span covering one claimed unit, from dispatch to settle.
///
/// The `unit.outcome` field is declared empty and filled by
/// [`record_outcome`].
pub fn start_unit_span(unit: &WorkUnit, worker_id: &str) -> Span {
    tracing::info_span!(
        "unit.process",
        "unit.id" = %unit.id,
        "unit.kind" = %unit.kind,
        "unit.attempt" = unit.attempt_count,
        "worker.id" = worker_id,
        "unit.outcome" = tracing::field::Empty,
    )
}

/// Record how processing ended on the unit's span.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("unit.outcome", outcome);
}
