//! Worker-level error type.
//!
//! The engine uses the variant to decide control flow:
//! - `NotReady`              — the node must be polled again on a later run;
//!                             nothing is wrong yet.
//! - `FailedWithContinue`    — the node failed but its successors may proceed;
//!                             the node is recorded as completed.
//! - `FailedWithTermination` — the node failed in a way that invalidates the
//!                             whole instance; the workflow is terminated.
//! - `BusinessCritical` / `BusinessWarning` — caller-tagged severities for
//!                             alerting; treated as soft failures by the engine.
//! - `Other`                 — anything else; counted against the node's
//!                             failure budget and retried on a later run.

use thiserror::Error;

/// Errors returned by a worker's `run` / `wait_check` hooks.
#[derive(Debug, Error, Clone)]
pub enum WorkerError {
    /// The node is waiting on something external; poll again later.
    #[error("task not ready: {0}")]
    NotReady(String),

    /// The node failed but the workflow should move on as if it completed.
    #[error("task failed, continuing: {0}")]
    FailedWithContinue(String),

    /// The node failed and the whole workflow instance must terminate.
    #[error("task failed, terminating workflow: {0}")]
    FailedWithTermination(String),

    /// Business failure that should page somebody.
    #[error("business critical error: {0}")]
    BusinessCritical(String),

    /// Business failure that only warrants a warning.
    #[error("business warning error: {0}")]
    BusinessWarning(String),

    /// Any other failure; retried on the next run.
    #[error("{0}")]
    Other(String),
}

impl WorkerError {
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn failed_with_continue(msg: impl Into<String>) -> Self {
        Self::FailedWithContinue(msg.into())
    }

    pub fn failed_with_termination(msg: impl Into<String>) -> Self {
        Self::FailedWithTermination(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
