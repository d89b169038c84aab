//! Engine-level error taxonomy.
//!
//! Several variants are *sentinels* that reshape control flow rather than
//! report defects: `NotReady` parks a node for a later run,
//! `FailedWithContinue` lets successors proceed past a failed node, and
//! `FailedWithTermination` tears the whole instance down. The phase machine
//! is the single place where kinds get rewritten (timeout and retry
//! exhaustion both become `FailedWithTermination`); everywhere else errors
//! only accumulate context via [`EngineError::context`], which preserves the
//! variant so kind checks keep working through wrapping.

use thiserror::Error;
use workers::WorkerError;

/// Errors produced by the workflow engine (compilation, execution, service
/// operations).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Registry / compilation ------
    /// No config loaded for the workflow type.
    #[error("workflow config not found: {0}")]
    ConfigNotFound(String),

    /// A compiled definition was expected but is missing or unusable.
    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    /// No worker registered for `(workflow_type, task_type)`.
    #[error("task worker not found: {0}")]
    WorkerNotFound(String),

    /// A worker was registered twice for the same `(workflow_type, task_type)`.
    #[error("task worker already registered: {0}")]
    WorkerAlreadyRegistered(String),

    /// A node references an id that is not declared in the config.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The config's next-edges form a cycle.
    #[error("cycle detected in workflow graph: {0}")]
    CycleDetected(String),

    // ------ Rows ------
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),

    #[error("task instance not found: {0}")]
    TaskInstanceNotFound(String),

    // ------ Control-flow sentinels ------
    /// The node is waiting on something external; retried by a later run.
    #[error("task not ready: {0}")]
    NotReady(String),

    /// The node failed but is treated as completed; successors proceed.
    #[error("task failed, continuing: {0}")]
    FailedWithContinue(String),

    /// The node failed and the instance is terminated; triggers
    /// cascade-cancel of its unfinished siblings.
    #[error("task failed, terminating workflow: {0}")]
    FailedWithTermination(String),

    // ------ Caller-tagged severities ------
    #[error("business critical error: {0}")]
    BusinessCritical(String),

    #[error("business warning error: {0}")]
    BusinessWarning(String),

    // ------ Concurrency ------
    /// Another holder owns the instance lock; nothing was done.
    #[error("lock failed: {0}")]
    LockFailed(String),

    #[error("lock wait timed out: {0}")]
    LockWaitTimeout(String),

    // ------ Input / persistence / rest ------
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    #[error("db error: {0}")]
    Db(#[from] db::DbError),

    #[error("{0}")]
    Other(String),
}

/// The bare kind of an [`EngineError`], for dispatch that must survive
/// message wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigNotFound,
    DefinitionNotFound,
    WorkerNotFound,
    WorkerAlreadyRegistered,
    UnknownNode,
    CycleDetected,
    InstanceNotFound,
    TaskInstanceNotFound,
    NotReady,
    FailedWithContinue,
    FailedWithTermination,
    BusinessCritical,
    BusinessWarning,
    LockFailed,
    LockWaitTimeout,
    ParamInvalid,
    Db,
    Other,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound(_) => ErrorKind::ConfigNotFound,
            Self::DefinitionNotFound(_) => ErrorKind::DefinitionNotFound,
            Self::WorkerNotFound(_) => ErrorKind::WorkerNotFound,
            Self::WorkerAlreadyRegistered(_) => ErrorKind::WorkerAlreadyRegistered,
            Self::UnknownNode(_) => ErrorKind::UnknownNode,
            Self::CycleDetected(_) => ErrorKind::CycleDetected,
            Self::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            Self::TaskInstanceNotFound(_) => ErrorKind::TaskInstanceNotFound,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::FailedWithContinue(_) => ErrorKind::FailedWithContinue,
            Self::FailedWithTermination(_) => ErrorKind::FailedWithTermination,
            Self::BusinessCritical(_) => ErrorKind::BusinessCritical,
            Self::BusinessWarning(_) => ErrorKind::BusinessWarning,
            Self::LockFailed(_) => ErrorKind::LockFailed,
            Self::LockWaitTimeout(_) => ErrorKind::LockWaitTimeout,
            Self::ParamInvalid(_) => ErrorKind::ParamInvalid,
            Self::Db(_) => ErrorKind::Db,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether callers should treat this as requiring human attention.
    /// Drivers map serious → `error!` logs, everything else → `warn!`.
    pub fn is_serious(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConfigNotFound
                | ErrorKind::DefinitionNotFound
                | ErrorKind::WorkerNotFound
                | ErrorKind::WorkerAlreadyRegistered
                | ErrorKind::UnknownNode
                | ErrorKind::CycleDetected
                | ErrorKind::InstanceNotFound
                | ErrorKind::TaskInstanceNotFound
                | ErrorKind::FailedWithTermination
                | ErrorKind::FailedWithContinue
                | ErrorKind::BusinessCritical
                | ErrorKind::ParamInvalid
        )
    }

    /// Prepend call-site context to the message, keeping the variant (and
    /// therefore the kind) intact.
    pub fn context(self, msg: impl AsRef<str>) -> Self {
        let msg = msg.as_ref();
        let wrap = |inner: String| format!("{msg}: {inner}");
        match self {
            Self::ConfigNotFound(m) => Self::ConfigNotFound(wrap(m)),
            Self::DefinitionNotFound(m) => Self::DefinitionNotFound(wrap(m)),
            Self::WorkerNotFound(m) => Self::WorkerNotFound(wrap(m)),
            Self::WorkerAlreadyRegistered(m) => Self::WorkerAlreadyRegistered(wrap(m)),
            Self::UnknownNode(m) => Self::UnknownNode(wrap(m)),
            Self::CycleDetected(m) => Self::CycleDetected(wrap(m)),
            Self::InstanceNotFound(m) => Self::InstanceNotFound(wrap(m)),
            Self::TaskInstanceNotFound(m) => Self::TaskInstanceNotFound(wrap(m)),
            Self::NotReady(m) => Self::NotReady(wrap(m)),
            Self::FailedWithContinue(m) => Self::FailedWithContinue(wrap(m)),
            Self::FailedWithTermination(m) => Self::FailedWithTermination(wrap(m)),
            Self::BusinessCritical(m) => Self::BusinessCritical(wrap(m)),
            Self::BusinessWarning(m) => Self::BusinessWarning(wrap(m)),
            Self::LockFailed(m) => Self::LockFailed(wrap(m)),
            Self::LockWaitTimeout(m) => Self::LockWaitTimeout(wrap(m)),
            Self::ParamInvalid(m) => Self::ParamInvalid(wrap(m)),
            // structured source kept as-is; context would erase the cause
            err @ Self::Db(_) => err,
            Self::Other(m) => Self::Other(wrap(m)),
        }
    }
}

impl From<WorkerError> for EngineError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::NotReady(m) => Self::NotReady(m),
            WorkerError::FailedWithContinue(m) => Self::FailedWithContinue(m),
            WorkerError::FailedWithTermination(m) => Self::FailedWithTermination(m),
            WorkerError::BusinessCritical(m) => Self::BusinessCritical(m),
            WorkerError::BusinessWarning(m) => Self::BusinessWarning(m),
            WorkerError::Other(m) => Self::Other(m),
        }
    }
}
