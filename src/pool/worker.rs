//! One worker loop: claim -> execute -> settle.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info, warn};

use super::{Shared, StatsCell, WorkerStats};
use crate::error::Error;
use crate::event::EventKind;
use crate::handler::Handler;
use crate::model::{Lease, WorkUnit};
use crate::retry::Decision;
use crate::store::{Abandoned, Claim};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_unit_span};

/// How a handler invocation ended.
enum Outcome {
    Ok,
    Error(String),
    Panic(String),
    Timeout(Duration),
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Error(_) => "error",
            Outcome::Panic(_) => "panic",
            Outcome::Timeout(_) => "timeout",
        }
    }

    /// Failure detail recorded as the unit's `last_error`.
    fn failure(&self) -> Option<String> {
        let detail = match self {
            Outcome::Ok => return None,
            Outcome::Error(e) => e.clone(),
            Outcome::Panic(msg) => format!("panicked: {msg}"),
            Outcome::Timeout(after) => format!("timed out after {}ms", after.as_millis()),
        };
        Some(Error::Handler(detail).to_string())
    }
}

#[derive(Clone, Copy)]
enum Settle<'a> {
    Complete,
    Fail(&'a str),
    Requeue(&'a str, Duration),
}

/// Aborts the handler task if the worker gives up on it (timeout, or the
/// worker loop itself being aborted at shutdown).
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(super) struct Worker {
    id: String,
    shared: Arc<Shared>,
    stats: StatsCell,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub(super) fn new(
        id: String,
        shared: Arc<Shared>,
        stats: StatsCell,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            shared,
            stats,
            shutdown,
        }
    }

    fn update(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub(super) async fn run(mut self) {
        let config = &self.shared.config;
        let opts = config.claim_options();
        let idle = config.idle_interval;
        let max_error_backoff = config.max_error_backoff;
        let mut error_backoff = idle;

        self.update(|s| s.running = true);
        info!(worker_id = %self.id, "worker started");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let claim = self.shared.store.claim(&self.id, &opts).await;
            if let Ok(claim) = &claim {
                self.report_abandoned(&claim.abandoned);
            }
            match claim {
                Ok(Claim {
                    unit: Some(unit),
                    previous_owner,
                    ..
                }) => {
                    metrics::claim_attempts().add(1, &[KeyValue::new("result", "claimed")]);
                    error_backoff = idle;
                    self.process(unit, previous_owner).await;
                }
                Ok(_) => {
                    metrics::claim_attempts().add(1, &[KeyValue::new("result", "empty")]);
                    if self.pause(idle).await {
                        break;
                    }
                }
                Err(e) => {
                    metrics::claim_attempts().add(1, &[KeyValue::new("result", "error")]);
                    warn!(
                        worker_id = %self.id,
                        error = %e,
                        retry_in_ms = error_backoff.as_millis() as u64,
                        "claim failed"
                    );
                    if self.pause(error_backoff).await {
                        break;
                    }
                    error_backoff = (error_backoff * 2).min(max_error_backoff);
                }
            }
        }

        let (processed, failed) = {
            let stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            (stats.processed, stats.failed)
        };
        self.update(|s| {
            s.running = false;
            s.busy = false;
        });
        info!(worker_id = %self.id, processed, failed, "worker stopped");
    }

    /// Sleep unless shutdown is signalled first. Returns true on shutdown.
    async fn pause(&mut self, d: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(d) => false,
            changed = self.shutdown.changed() => changed.is_err() || *self.shutdown.borrow(),
        }
    }

    /// Units the store failed during our claim because their lease ran out
    /// on the last attempt.
    fn report_abandoned(&self, abandoned: &[Abandoned]) {
        for unit in abandoned {
            self.shared.events.emit(
                unit.id,
                &unit.owner,
                EventKind::Failed {
                    attempt: unit.attempt,
                    error: unit.error.clone(),
                },
            );
        }
    }

    async fn process(&self, unit: WorkUnit, previous_owner: Option<String>) {
        let span = start_unit_span(&unit, &self.id);
        let Some(lease) = unit.lease() else {
            error!(unit_id = %unit.id, state = %unit.state, "claim returned a unit that is not owned");
            return;
        };

        async {
            let events = &self.shared.events;
            events.emit(
                unit.id,
                &self.id,
                EventKind::Claimed {
                    attempt: unit.attempt_count,
                    lease_expires_at: unit.lease_expires_at,
                    previous_owner,
                },
            );
            self.update(|s| {
                s.busy = true;
                s.last_unit_at = Some(Utc::now());
            });

            let Some(handler) = self.shared.registry.get(&unit.kind) else {
                let error = Error::NoHandlerRegistered(unit.kind.clone()).to_string();
                record_outcome(&span, "unroutable");
                if self.settle(&lease, Settle::Fail(&error)).await {
                    events.emit(
                        unit.id,
                        &self.id,
                        EventKind::Failed {
                            attempt: unit.attempt_count,
                            error,
                        },
                    );
                }
                self.update(|s| {
                    s.failed += 1;
                    s.busy = false;
                });
                return;
            };

            let started = Instant::now();
            let outcome = self.execute(handler, &unit).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            record_outcome(&span, outcome.label());
            metrics::handler_duration_ms().record(
                duration_ms as f64,
                &[
                    KeyValue::new("kind", unit.kind.clone()),
                    KeyValue::new("outcome", outcome.label()),
                ],
            );

            match outcome.failure() {
                None => {
                    if self.settle(&lease, Settle::Complete).await {
                        events.emit(
                            unit.id,
                            &self.id,
                            EventKind::Completed {
                                attempt: unit.attempt_count,
                                duration_ms,
                            },
                        );
                    }
                    self.update(|s| s.processed += 1);
                }
                Some(error) => {
                    self.update(|s| s.failed += 1);
                    self.on_failure(&unit, &lease, error).await;
                }
            }

            self.update(|s| s.busy = false);
        }
        .instrument(span.clone())
        .await
    }

    /// Route a handler failure through the retry policy.
    async fn on_failure(&self, unit: &WorkUnit, lease: &Lease, error: String) {
        let events = &self.shared.events;
        match self.shared.config.retry.on_failure(unit) {
            Decision::Requeue { delay } => {
                if self.settle(lease, Settle::Requeue(&error, delay)).await {
                    let now = Utc::now();
                    let not_before = TimeDelta::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    events.emit(
                        unit.id,
                        &self.id,
                        EventKind::Requeued {
                            attempt: unit.attempt_count,
                            error,
                            not_before,
                        },
                    );
                }
            }
            Decision::Abandon => {
                if self.settle(lease, Settle::Fail(&error)).await {
                    events.emit(
                        unit.id,
                        &self.id,
                        EventKind::Failed {
                            attempt: unit.attempt_count,
                            error,
                        },
                    );
                }
            }
        }
    }

    /// Run the handler in its own task so a panic cannot take the loop down.
    async fn execute(&self, handler: Arc<dyn Handler>, unit: &WorkUnit) -> Outcome {
        let timeout = self.shared.config.handler_timeout();
        let owned = unit.clone();
        let handle = tokio::spawn(
            async move { handler.handle(&owned).await }.instrument(tracing::Span::current()),
        );
        let _guard = AbortOnDrop(handle.abort_handle());

        match tokio::time::timeout(timeout, handle).await {
            Err(_) => Outcome::Timeout(timeout),
            Ok(Ok(Ok(()))) => Outcome::Ok,
            Ok(Ok(Err(e))) => Outcome::Error(format!("{e:#}")),
            Ok(Err(join_err)) if join_err.is_panic() => {
                Outcome::Panic(panic_message(join_err.into_panic()))
            }
            Ok(Err(join_err)) => Outcome::Error(join_err.to_string()),
        }
    }

    /// Apply a settle, retrying transient store errors a bounded number of times.
    ///
    /// Returns whether the transition was applied. When it was not, the unit is
    /// either already settled, owned by someone else, or will be recovered by
    /// lease expiry.
    async fn settle(&self, lease: &Lease, action: Settle<'_>) -> bool {
        let store = &self.shared.store;
        let mut delay = self.shared.config.idle_interval;
        let mut retries = 0;

        loop {
            let result = match action {
                Settle::Complete => store.settle_completed(lease).await,
                Settle::Fail(error) => store.settle_failed(lease, error).await,
                Settle::Requeue(error, after) => store.requeue(lease, error, after).await,
            };

            match result {
                Ok(()) => return true,
                Err(Error::AlreadySettled(id)) => {
                    debug!(unit_id = %id, "unit already settled");
                    return false;
                }
                Err(e @ Error::LeaseLost { .. }) => {
                    warn!(error = %e, "lease lost before settle, result discarded");
                    return false;
                }
                Err(e) if e.is_transient() && retries < self.shared.config.settle_retries => {
                    retries += 1;
                    warn!(
                        unit_id = %lease.unit_id,
                        error = %e,
                        retry = retries,
                        "settle failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.shared.config.max_error_backoff);
                }
                Err(e) => {
                    error!(
                        unit_id = %lease.unit_id,
                        error = %e,
                        "settle failed, unit will be recovered after lease expiry"
                    );
                    return false;
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
