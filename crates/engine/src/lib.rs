//! `engine` crate — definition compiler, DAG visitor, phase machine and the
//! workflow service facade.
//!
//! The engine executes user-defined DAGs of tasks against a durable store
//! (the `db` crate), driving each node's worker (the `workers` crate) through
//! a multi-phase state machine under a per-instance lock. Everything is
//! resumable: a later `run_workflow` call picks up exactly where the stored
//! task rows left off.

pub mod dag;
pub mod error;
pub mod lock;
pub mod models;
pub mod registry;
pub mod service;

mod executor;

pub use dag::{WorkflowDefinition, END_TASK_TYPE, ROOT_TASK_TYPE};
pub use error::{EngineError, ErrorKind};
pub use lock::{LocalLock, LockScope, WorkflowLock};
pub use models::{
    AddNodeExternalEventParams, CreateWorkflowRequest, NodeConfig, NodeExternalEvent,
    RestartWorkflowInstanceParams, RestartWorkflowNodeParams, WorkflowConfig,
};
pub use registry::WorkflowRegistry;
pub use service::WorkflowService;
