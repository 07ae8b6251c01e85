//! Unit-of-work callbacks and their registry.

use super::context::TaskContext;
use crate::error::{Error, Result};
use crate::model::Lane;
use crate::routing::RoutingTable;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// Worth another attempt: network trouble, timeouts, a dependency down.
    Retryable(String),
    /// Will fail the same way again: bad arguments, a programming error.
    Fatal(String),
}

impl TaskFailure {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// What a callback returns: the result payload, or a typed failure.
pub type TaskOutcome = std::result::Result<Value, TaskFailure>;

/// A unit-of-work callback.
///
/// `S` is the pool's shared state (an HTTP client, a model handle), built
/// once per pool and handed to every invocation. Callbacks may be invoked
/// more than once for the same task and must tolerate it.
#[async_trait]
pub trait Handler<S>: Send + Sync {
    async fn run(&self, state: Arc<S>, ctx: TaskContext, args: Value) -> TaskOutcome;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<S, F, Fut> Handler<S> for FnHandler<F>
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, TaskContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = TaskOutcome> + Send,
{
    async fn run(&self, state: Arc<S>, ctx: TaskContext, args: Value) -> TaskOutcome {
        (self.0)(state, ctx, args).await
    }
}

/// Handlers indexed by task kind, with an optional catch-all.
pub struct HandlerRegistry<S> {
    handlers: HashMap<String, Arc<dyn Handler<S>>>,
    fallback: Option<Arc<dyn Handler<S>>>,
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: None,
        }
    }
}

impl<S: Send + Sync + 'static> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, handler: impl Handler<S> + 'static) -> &mut Self {
        self.handlers.insert(kind.into(), Arc::new(handler));
        self
    }

    pub fn register_fn<F, Fut>(&mut self, kind: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Arc<S>, TaskContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutcome> + Send + 'static,
    {
        self.register(kind, FnHandler(f))
    }

    /// Handle every routed kind without a dedicated handler.
    pub fn set_fallback(&mut self, handler: impl Handler<S> + 'static) -> &mut Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler<S>>> {
        self.handlers
            .get(kind)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Check the registry against the routing table at startup: every
    /// registered kind must be routed, and every kind routed to a served
    /// lane must have a handler.
    pub fn validate(&self, routes: &RoutingTable, lanes: &[Lane]) -> Result<()> {
        for kind in self.handlers.keys() {
            routes.policy(kind).map_err(|_| {
                Error::Config(format!("handler registered for unrouted kind {kind:?}"))
            })?;
        }
        if self.fallback.is_some() {
            return Ok(());
        }
        let missing: Vec<&str> = routes
            .policies()
            .into_iter()
            .filter(|p| lanes.contains(&p.lane) && !self.handlers.contains_key(&p.kind))
            .map(|p| p.kind.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::Config(format!(
                "no handler for routed kinds: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}
