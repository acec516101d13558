//! # claimq
//!
//! Exactly-once, horizontally scalable work distribution over a shared
//! relational table, without a message broker.
//!
//! Ingestion enqueues [`model::WorkUnit`]s into a [`store::QueueStore`].
//! A [`pool::WorkerPool`] runs a fixed number of loops that atomically claim
//! the oldest eligible unit under a lease, dispatch it to the handler
//! registered for its kind, and settle the result. Failures go through the
//! [`retry::RetryPolicy`]; units held by crashed workers come back once
//! their lease expires.

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod model;
pub mod monitor;
pub mod pool;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
pub use handler::{Handler, HandlerRegistry, handler_fn};
pub use model::{Lease, QueueStats, State, UnitId, WorkUnit};
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use retry::{Backoff, Decision, RetryPolicy};
pub use store::{Abandoned, Claim, ClaimOptions, MemoryStore, PgStore, QueueStore};
