//! Handler dispatch: an explicit `kind -> handler` map populated at startup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::model::WorkUnit;

/// Processing logic for one unit kind.
///
/// Return `Err` to route the unit through the retry policy. Handlers may run
/// more than once for the same unit (lease expiry, retries), so they should be
/// idempotent.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, unit: &WorkUnit) -> anyhow::Result<()>;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(WorkUnit) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, unit: &WorkUnit) -> anyhow::Result<()> {
        (self.0)(unit.clone()).await
    }
}

/// Wrap an async closure as a [`Handler`].
///
/// ```
/// use claimq::handler::{HandlerRegistry, handler_fn};
///
/// let registry = HandlerRegistry::new().register(
///     "echo",
///     handler_fn(|unit| async move {
///         tracing::info!(payload = %unit.payload, "echo");
///         Ok(())
///     }),
/// );
/// assert!(registry.get("echo").is_some());
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(WorkUnit) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    FnHandler(f)
}

/// Registry of handlers, indexed by unit kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create an empty registry with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn register(mut self, kind: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
