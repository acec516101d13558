//! Worker pool: a fixed number of claim -> execute -> settle loops.
//!
//! Pools on different hosts share nothing but the store; running more
//! instances against the same database is how the system scales out.
//!
//! Lifecycle: `stopped -> running -> stopping -> stopped`.

mod worker;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::handler::HandlerRegistry;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::{ClaimOptions, QueueStore, check_delay};

use worker::Worker;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of concurrent loops.
    pub size: usize,
    /// Prefix for worker ids; ids are `{instance_id}-{n}`.
    pub instance_id: String,
    /// Visibility timeout granted by each claim.
    pub lease_duration: Duration,
    /// Sleep between claims when the queue is empty.
    pub idle_interval: Duration,
    /// Ceiling for the backoff applied after store errors.
    pub max_error_backoff: Duration,
    /// How long `stop()` waits for in-flight handlers before aborting them.
    pub shutdown_grace: Duration,
    /// Handlers running longer than this are aborted and treated as failed.
    /// `None` means the lease duration.
    pub handler_timeout: Option<Duration>,
    /// `health_check` warns about loops idle for longer than this.
    pub idle_warning: Duration,
    /// Extra attempts for settle calls that hit a transient store error.
    pub settle_retries: u32,
    pub retry: RetryPolicy,
    /// Buffer size of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let mut instance_id = uuid::Uuid::new_v4().simple().to_string();
        instance_id.truncate(8);
        Self {
            size: 5,
            instance_id,
            lease_duration: Duration::from_secs(300),
            idle_interval: Duration::from_secs(1),
            max_error_backoff: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            handler_timeout: None,
            idle_warning: Duration::from_secs(600),
            settle_retries: 3,
            retry: RetryPolicy::default(),
            event_capacity: 1024,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::Config("worker pool size must be at least 1".into()));
        }
        if self.lease_duration.is_zero() {
            return Err(Error::Config("lease duration must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("max attempts must be at least 1".into()));
        }
        check_delay("lease duration", self.lease_duration)?;
        if let Some(timeout) = self.handler_timeout {
            check_delay("handler timeout", timeout)?;
        }
        if let Backoff::Exponential { max, .. } = self.retry.backoff {
            check_delay("retry backoff", max)?;
        }
        if self.instance_id.is_empty() {
            return Err(Error::Config("instance id must not be empty".into()));
        }
        if self.handler_timeout.is_some_and(|t| t > self.lease_duration) {
            warn!(
                handler_timeout = ?self.handler_timeout,
                lease = ?self.lease_duration,
                "handler timeout exceeds lease; units may be processed twice"
            );
        }
        Ok(())
    }

    pub fn claim_options(&self) -> ClaimOptions {
        ClaimOptions {
            lease_duration: self.lease_duration,
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout.unwrap_or(self.lease_duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Stopped,
    Running,
    Stopping,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolState::Stopped => "stopped",
            PoolState::Running => "running",
            PoolState::Stopping => "stopping",
        };
        write!(f, "{s}")
    }
}

/// Counters for one worker loop.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub running: bool,
    /// Currently executing a handler.
    pub busy: bool,
    pub processed: u64,
    pub failed: u64,
    pub started_at: DateTime<Utc>,
    pub last_unit_at: Option<DateTime<Utc>>,
}

impl WorkerStats {
    fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            running: false,
            busy: false,
            processed: 0,
            failed: 0,
            started_at: Utc::now(),
            last_unit_at: None,
        }
    }
}

/// Pool-wide snapshot returned by [`WorkerPool::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub size: usize,
    /// Loops currently alive.
    pub active_workers: usize,
    /// Loops currently inside a handler.
    pub busy_workers: usize,
    /// Units completed by this pool.
    pub processed: u64,
    /// Handler failures seen by this pool (retried or not).
    pub failed: u64,
    pub workers: Vec<WorkerStats>,
}

pub(crate) type StatsCell = Arc<Mutex<WorkerStats>>;

/// Everything a worker loop needs, shared by all loops of a pool.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) registry: HandlerRegistry,
    pub(crate) config: PoolConfig,
    pub(crate) events: EventBus,
}

struct Runtime {
    state: PoolState,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Option<JoinSet<()>>,
    workers: Vec<StatsCell>,
}

/// A fixed-size set of workers pulling from one [`QueueStore`].
pub struct WorkerPool {
    shared: Arc<Shared>,
    runtime: Mutex<Runtime>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn QueueStore>, registry: HandlerRegistry, config: PoolConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                config,
                events,
            }),
            runtime: Mutex::new(Runtime {
                state: PoolState::Stopped,
                shutdown: None,
                tasks: None,
                workers: Vec::new(),
            }),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn state(&self) -> PoolState {
        self.runtime().state
    }

    /// Receive one [`Event`] per unit state transition.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Spawn the worker loops. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let config = &self.shared.config;
        config.validate()?;

        let mut rt = self.runtime();
        if rt.state != PoolState::Stopped {
            return Err(Error::PoolState {
                expected: PoolState::Stopped,
                actual: rt.state,
            });
        }

        let (tx, rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let mut workers = Vec::with_capacity(config.size);

        for n in 0..config.size {
            let worker_id = format!("{}-{n}", config.instance_id);
            let stats: StatsCell = Arc::new(Mutex::new(WorkerStats::new(&worker_id)));
            let worker = Worker::new(
                worker_id,
                Arc::clone(&self.shared),
                Arc::clone(&stats),
                rx.clone(),
            );
            tasks.spawn(worker.run());
            workers.push(stats);
        }

        rt.state = PoolState::Running;
        rt.shutdown = Some(tx);
        rt.tasks = Some(tasks);
        rt.workers = workers;

        info!(
            pool_size = config.size,
            instance_id = %config.instance_id,
            handlers = self.shared.registry.len(),
            "worker pool started"
        );
        Ok(())
    }

    /// Stop claiming, let in-flight handlers finish within the grace period,
    /// then abort whatever is left. Aborted units are recovered by lease expiry.
    ///
    /// Stopping a stopped pool is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let (shutdown, tasks) = {
            let mut rt = self.runtime();
            match rt.state {
                PoolState::Running => {}
                PoolState::Stopped => return Ok(()),
                PoolState::Stopping => {
                    return Err(Error::PoolState {
                        expected: PoolState::Running,
                        actual: PoolState::Stopping,
                    });
                }
            }
            rt.state = PoolState::Stopping;
            (rt.shutdown.take(), rt.tasks.take())
        };

        info!("worker pool stopping");
        if let Some(tx) = shutdown {
            let _ = tx.send(true);
        }

        if let Some(mut tasks) = tasks {
            let grace = self.shared.config.shutdown_grace;
            if tokio::time::timeout(grace, drain(&mut tasks)).await.is_err() {
                warn!(
                    remaining = tasks.len(),
                    grace_ms = grace.as_millis() as u64,
                    "shutdown grace elapsed, aborting in-flight workers"
                );
                tasks.abort_all();
                drain(&mut tasks).await;
            }
        }

        let mut rt = self.runtime();
        for cell in &rt.workers {
            let mut s = cell.lock().unwrap_or_else(|e| e.into_inner());
            s.running = false;
            s.busy = false;
        }
        rt.state = PoolState::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let rt = self.runtime();
        let workers: Vec<WorkerStats> = rt
            .workers
            .iter()
            .map(|cell| cell.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect();

        PoolStats {
            state: rt.state,
            size: self.shared.config.size,
            active_workers: workers.iter().filter(|w| w.running).count(),
            busy_workers: workers.iter().filter(|w| w.busy).count(),
            processed: workers.iter().map(|w| w.processed).sum(),
            failed: workers.iter().map(|w| w.failed).sum(),
            workers,
        }
    }

    /// True while the pool is running and every loop is alive.
    ///
    /// Logs a warning for loops that have not picked up a unit within
    /// `idle_warning`; idleness alone does not make the pool unhealthy.
    pub fn health_check(&self) -> bool {
        let stats = self.stats();
        if stats.state != PoolState::Running {
            return false;
        }

        let now = Utc::now();
        for w in &stats.workers {
            let last = w.last_unit_at.unwrap_or(w.started_at);
            let idle = (now - last).to_std().unwrap_or_default();
            if idle > self.shared.config.idle_warning {
                warn!(worker_id = %w.worker_id, idle_secs = idle.as_secs(), "worker idle");
            }
        }

        stats.active_workers == stats.size
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res
            && e.is_panic()
        {
            error!("worker loop panicked: {e}");
        }
    }
}
