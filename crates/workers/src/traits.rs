//! The `TaskWorker` trait — the contract every task node must fulfil.

use async_trait::async_trait;

use crate::context::NodeContext;
use crate::WorkerError;

/// The two-hook worker contract.
///
/// `run` performs the synchronous part of the work — possibly dispatching an
/// external asynchronous job and recording its handle in the context.
/// `wait_check` is polled afterwards to verify the asynchronous part has
/// finished; return [`WorkerError::NotReady`] to be polled again on a later
/// engine run.
///
/// Mutations made to `ctx` inside either hook are persisted by the engine
/// after the hook returns — workers never touch the store directly.
#[async_trait]
pub trait TaskWorker: Send + Sync {
    /// Execute the node's synchronous work.
    async fn run(&self, ctx: &mut NodeContext) -> Result<(), WorkerError>;

    /// Verify completion of any asynchronous work started by [`run`].
    ///
    /// Most nodes have nothing to wait for; the default succeeds immediately.
    ///
    /// [`run`]: TaskWorker::run
    async fn wait_check(&self, _ctx: &mut NodeContext) -> Result<(), WorkerError> {
        Ok(())
    }
}
