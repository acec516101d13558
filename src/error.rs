//! Error types for claimq.

use thiserror::Error;

use crate::model::UnitId;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("work unit not found: {0}")]
    NotFound(UnitId),

    /// Settle call on a unit that is already `completed` or `failed`.
    /// Benign; callers treat it as a no-op.
    #[error("work unit {0} is already settled")]
    AlreadySettled(UnitId),

    /// The caller's claim was superseded: the unit was reclaimed after its
    /// lease expired, or already handed back to the queue.
    #[error("lease on work unit {id} (attempt {attempt}) is no longer held by {worker_id}")]
    LeaseLost {
        id: UnitId,
        worker_id: String,
        attempt: u32,
    },

    #[error("no handler registered for kind {0:?}")]
    NoHandlerRegistered(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] BoxError),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker pool is {actual}, expected {expected}")]
    PoolState {
        expected: crate::pool::PoolState,
        actual: crate::pool::PoolState,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    pub(crate) fn store(msg: impl Into<String>) -> Self {
        let msg: String = msg.into();
        Error::StoreUnavailable(msg.into())
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::StoreUnavailable(Box::new(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
