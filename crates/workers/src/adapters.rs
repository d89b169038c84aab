//! Convenience `TaskWorker` implementations.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::NodeContext;
use crate::{TaskWorker, WorkerError};

type HookFn = Box<
    dyn for<'a> Fn(&'a mut NodeContext) -> BoxFuture<'a, Result<(), WorkerError>> + Send + Sync,
>;

/// A worker built from closures: a required `run` hook and an optional
/// `wait_check` hook (defaulting to an immediate success).
///
/// ```ignore
/// let worker = FnWorker::new(|ctx| {
///     Box::pin(async move {
///         ctx.set(&["result"], "done");
///         Ok(())
///     })
/// });
/// ```
pub struct FnWorker {
    run: HookFn,
    wait_check: Option<HookFn>,
}

impl FnWorker {
    /// Create a worker from a `run` closure; `wait_check` is a no-op.
    pub fn new<F>(run: F) -> Self
    where
        F: for<'a> Fn(&'a mut NodeContext) -> BoxFuture<'a, Result<(), WorkerError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            run: Box::new(run),
            wait_check: None,
        }
    }

    /// Attach a `wait_check` closure.
    pub fn with_wait_check<F>(mut self, wait_check: F) -> Self
    where
        F: for<'a> Fn(&'a mut NodeContext) -> BoxFuture<'a, Result<(), WorkerError>>
            + Send
            + Sync
            + 'static,
    {
        self.wait_check = Some(Box::new(wait_check));
        self
    }
}

#[async_trait]
impl TaskWorker for FnWorker {
    async fn run(&self, ctx: &mut NodeContext) -> Result<(), WorkerError> {
        (self.run)(ctx).await
    }

    async fn wait_check(&self, ctx: &mut NodeContext) -> Result<(), WorkerError> {
        match &self.wait_check {
            Some(f) => f(ctx).await,
            None => Ok(()),
        }
    }
}

/// A worker that always succeeds without touching the context.
///
/// Bound to the engine's synthetic root and end nodes, and occasionally
/// useful as a placeholder in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWorker;

#[async_trait]
impl TaskWorker for NoopWorker {
    async fn run(&self, _ctx: &mut NodeContext) -> Result<(), WorkerError> {
        Ok(())
    }
}
