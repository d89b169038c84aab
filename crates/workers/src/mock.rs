//! `MockWorker` — a scripted test double for `TaskWorker`.
//!
//! Each hook plays back a programmed sequence of outcomes (the last outcome
//! repeats once the script is exhausted) and records how often it was called,
//! so tests can assert both engine decisions and call counts.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::context::NodeContext;
use crate::{TaskWorker, WorkerError};

/// One scripted hook outcome.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed, optionally writing a key into the context first.
    Ok,
    /// Fail with the given error.
    Fail(WorkerError),
}

#[derive(Default)]
struct Script {
    outcomes: Vec<MockOutcome>,
    calls: AtomicUsize,
}

impl Script {
    fn next(&self) -> MockOutcome {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.outcomes.is_empty() {
            return MockOutcome::Ok;
        }
        let idx = n.min(self.outcomes.len() - 1);
        self.outcomes[idx].clone()
    }
}

/// A mock worker with independent scripts for each hook.
pub struct MockWorker {
    /// Label used in test assertions and context markers.
    pub name: String,
    run_script: Script,
    check_script: Script,
    /// Context snapshots taken at each `run` call, in order.
    seen: Mutex<Vec<NodeContext>>,
}

impl MockWorker {
    /// A mock whose hooks always succeed.
    pub fn succeeding(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run_script: Script::default(),
            check_script: Script::default(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Script the `run` hook with a sequence of outcomes.
    pub fn with_run_outcomes(mut self, outcomes: Vec<MockOutcome>) -> Self {
        self.run_script.outcomes = outcomes;
        self
    }

    /// Script the `wait_check` hook with a sequence of outcomes.
    pub fn with_check_outcomes(mut self, outcomes: Vec<MockOutcome>) -> Self {
        self.check_script.outcomes = outcomes;
        self
    }

    /// A mock whose `run` hook always fails with `err`.
    pub fn failing(name: impl Into<String>, err: WorkerError) -> Self {
        Self::succeeding(name).with_run_outcomes(vec![MockOutcome::Fail(err)])
    }

    /// Number of `run` invocations so far.
    pub fn run_calls(&self) -> usize {
        self.run_script.calls.load(Ordering::SeqCst)
    }

    /// Number of `wait_check` invocations so far.
    pub fn check_calls(&self) -> usize {
        self.check_script.calls.load(Ordering::SeqCst)
    }

    /// Context snapshots observed by `run`, in call order.
    pub fn seen_contexts(&self) -> Vec<NodeContext> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskWorker for MockWorker {
    async fn run(&self, ctx: &mut NodeContext) -> Result<(), WorkerError> {
        self.seen.lock().unwrap().push(ctx.clone());
        match self.run_script.next() {
            MockOutcome::Ok => {
                ctx.set(&["ran_by"], self.name.as_str());
                Ok(())
            }
            MockOutcome::Fail(err) => Err(err),
        }
    }

    async fn wait_check(&self, _ctx: &mut NodeContext) -> Result<(), WorkerError> {
        match self.check_script.next() {
            MockOutcome::Ok => Ok(()),
            MockOutcome::Fail(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripts_play_back_in_order_and_last_repeats() {
        let worker = MockWorker::succeeding("m").with_run_outcomes(vec![
            MockOutcome::Fail(WorkerError::not_ready("warming up")),
            MockOutcome::Ok,
        ]);

        let mut ctx = NodeContext::new();
        assert!(matches!(
            worker.run(&mut ctx).await,
            Err(WorkerError::NotReady(_))
        ));
        assert!(worker.run(&mut ctx).await.is_ok());
        // script exhausted: last outcome repeats
        assert!(worker.run(&mut ctx).await.is_ok());
        assert_eq!(worker.run_calls(), 3);
    }

    #[tokio::test]
    async fn records_seen_contexts() {
        let worker = MockWorker::succeeding("m");
        let mut ctx = NodeContext::new();
        ctx.set(&["input"], 42);
        worker.run(&mut ctx).await.expect("run");

        let seen = worker.seen_contexts();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].get_i64(&["input"]), Some(42));
    }
}
