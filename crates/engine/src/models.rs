//! Core domain models for the workflow engine.
//!
//! The declarative [`WorkflowConfig`] is what users author (usually as JSON);
//! the runtime entities ([`WorkflowInstance`], [`TaskNode`]) are hydrated
//! from store rows for the duration of one service call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;

use db::models::{InstanceStatus, TaskInstanceRow, TaskStatus, WorkflowInstanceRow};
use workers::NodeContext;

use crate::dag::WorkflowDefinition;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Declarative config
// ---------------------------------------------------------------------------

/// A complete declarative workflow: the unit loaded into the registry and
/// compiled into a [`WorkflowDefinition`] on first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow type id — unique across the process.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Declared task nodes.
    pub nodes: Vec<NodeConfig>,
}

/// One declared task node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node id, unique within the config; doubles as the task type.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Ids of successor nodes; empty means the node feeds the synthetic end.
    #[serde(default)]
    pub next_nodes: Vec<String>,
    /// Terminate the workflow once the node has failed this many times;
    /// absent or non-positive disables the bound.
    #[serde(default)]
    pub fail_max_count: Option<i64>,
    /// Terminate the workflow when a failing node has been alive longer than
    /// this many seconds (counted from the task row's creation); absent or
    /// non-positive disables the bound.
    #[serde(default)]
    pub max_wait_time_ts: Option<i64>,
}

// ---------------------------------------------------------------------------
// Service requests
// ---------------------------------------------------------------------------

/// Request for `create_workflow`.
#[derive(Debug, Clone, Default)]
pub struct CreateWorkflowRequest {
    pub workflow_type: String,
    pub business_id: String,
    /// Initial `workflow_context` content.
    pub context: Option<Map<String, Value>>,
    /// Run the instance inline after creating it.
    pub is_run: bool,
    /// Opaque external correlation id.
    pub task_id: i64,
}

/// An externally injected event, versioned by `event_ts` (newer overwrites
/// older; stale submissions are rejected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExternalEvent {
    /// Event time in Unix seconds; acts as the event's version.
    pub event_ts: i64,
    pub event_content: String,
}

/// Parameters for `add_node_external_event`.
#[derive(Debug, Clone)]
pub struct AddNodeExternalEventParams {
    pub workflow_instance_id: i64,
    pub task_type: String,
    pub event: NodeExternalEvent,
}

/// Parameters for `restart_workflow_node`.
#[derive(Debug, Clone)]
pub struct RestartWorkflowNodeParams {
    pub workflow_instance_id: i64,
    /// Node to reset; all transitively reachable descendants are reset too.
    pub task_type: String,
    /// Also flip a terminal instance back to running. Without this, restarting
    /// a node of a terminal instance is rejected.
    pub is_forced_restart_workflow: bool,
}

/// Parameters for `restart_workflow_instance`.
#[derive(Debug, Clone)]
pub struct RestartWorkflowInstanceParams {
    pub workflow_instance_id: i64,
    /// Run the instance inline after resetting it.
    pub is_run: bool,
}

// ---------------------------------------------------------------------------
// Runtime entities
// ---------------------------------------------------------------------------

/// A hydrated workflow instance, alive for the duration of one service call.
#[derive(Clone)]
pub struct WorkflowInstance {
    pub id: i64,
    pub workflow_type: String,
    pub business_id: String,
    pub status: InstanceStatus,
    pub workflow_context: NodeContext,
    pub task_id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    /// Attached when the definition compiled; absent e.g. when an instance
    /// was created in a process that does not host the workers.
    pub definition: Option<Arc<WorkflowDefinition>>,
}

// Manual impl: the attached definition holds worker trait objects and is
// summarized by its id.
impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("id", &self.id)
            .field("workflow_type", &self.workflow_type)
            .field("business_id", &self.business_id)
            .field("status", &self.status)
            .field("task_id", &self.task_id)
            .field("definition", &self.definition.as_ref().map(|d| d.id.as_str()))
            .finish_non_exhaustive()
    }
}

impl WorkflowInstance {
    pub fn from_row(row: &WorkflowInstanceRow) -> Result<Self, EngineError> {
        let status = InstanceStatus::from_str(&row.status).map_err(EngineError::Other)?;
        Ok(Self {
            id: row.id,
            workflow_type: row.workflow_type.clone(),
            business_id: row.business_id.clone(),
            status,
            workflow_context: NodeContext::from_value(row.workflow_context.clone()),
            task_id: row.task_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            definition: None,
        })
    }
}

/// One entry of the request-scoped task-node map: the live view of a task
/// row while the visitor walks the graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub node_context: NodeContext,
    pub fail_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskNode {
    pub fn from_row(row: &TaskInstanceRow) -> Result<Self, EngineError> {
        let status = TaskStatus::from_str(&row.status).map_err(EngineError::Other)?;
        Ok(Self {
            id: row.id,
            workflow_instance_id: row.workflow_instance_id,
            task_type: row.task_type.clone(),
            status,
            node_context: NodeContext::from_value(row.node_context.clone()),
            fail_count: row.fail_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Detail views
// ---------------------------------------------------------------------------

/// Full instance view: the instance plus one entry per definition node, in
/// definition order, whether or not a row exists yet.
#[derive(Debug, Clone)]
pub struct WorkflowInstanceDetail {
    pub id: i64,
    pub workflow_type: String,
    pub business_id: String,
    pub status: InstanceStatus,
    pub workflow_context: NodeContext,
    pub created_at: i64,
    pub updated_at: i64,
    pub tasks: Vec<TaskInstanceDetail>,
}

/// One node of a detail view. Nodes the engine has not reached yet have no
/// row: `id` is `None` and `status` is [`TaskStatus::Uncreated`].
#[derive(Debug, Clone)]
pub struct TaskInstanceDetail {
    pub id: Option<i64>,
    pub workflow_instance_id: i64,
    pub task_type: String,
    pub task_name: String,
    pub status: TaskStatus,
    pub node_context: Option<NodeContext>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
    /// Predecessor task types from the compiled graph.
    pub pre_nodes_keys: Vec<String>,
    /// Successor task types from the compiled graph.
    pub next_nodes_keys: Vec<String>,
}
