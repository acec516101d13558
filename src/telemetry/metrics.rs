//! Metric instrument factories for claimq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"claimq"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for claimq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("claimq")
}

/// Counter: units inserted into the queue.
/// Labels: `kind`.
pub fn units_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("claimq.units.enqueued")
        .with_description("Number of work units enqueued")
        .build()
}

/// Counter: unit state transitions.
/// Labels: `from`, `to`.
pub fn unit_transitions() -> Counter<u64> {
    meter()
        .u64_counter("claimq.units.transitions")
        .with_description("Number of work unit state transitions")
        .build()
}

/// Counter: claim calls.
/// Labels: `result` ("claimed" | "empty" | "error").
pub fn claim_attempts() -> Counter<u64> {
    meter()
        .u64_counter("claimq.claim.attempts")
        .with_description("Number of claim attempts")
        .build()
}

/// Histogram: handler execution time in milliseconds.
/// Labels: `kind`, `outcome` ("ok" | "error" | "panic" | "timeout").
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("claimq.handler.duration_ms")
        .with_description("Handler execution time in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: owned units seen past lease expiry by the lease monitor.
/// Labels: `kind`.
pub fn leases_expired() -> Counter<u64> {
    meter()
        .u64_counter("claimq.lease.expired")
        .with_description("Owned units observed past lease expiry")
        .build()
}
