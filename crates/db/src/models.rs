//! Row structs and query/update parameter objects for the two workflow tables.
//!
//! These are *persistence* models — they carry no domain behaviour. Rows keep
//! `status` as the raw string stored in the database; the typed
//! [`InstanceStatus`] / [`TaskStatus`] enums live alongside for the engine to
//! parse into.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Init,
    Running,
    /// Terminal: every path through the graph completed.
    Completed,
    /// Terminal: a node failure terminated the workflow.
    Failed,
    /// Terminal: cancelled by an operator.
    Canceled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal instances never progress again except via explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// Lifecycle of a single task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Never stored: synthesized in detail views for nodes without a row.
    Uncreated,
    Init,
    /// The row exists but must be re-initialized and re-run.
    Restarting,
    Running,
    Pending,
    Finishing,
    /// Terminal. Note that a continue-on-failure node lands here, not in
    /// `Failed`.
    Completed,
    /// Terminal: this node terminated the workflow.
    Failed,
    /// Terminal: cancelled, directly or via cascade.
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncreated => "uncreated",
            Self::Init => "init",
            Self::Restarting => "restarting",
            Self::Running => "running",
            Self::Pending => "pending",
            Self::Finishing => "finishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// Terminal tasks never run again except via explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncreated" => Ok(Self::Uncreated),
            "init" => Ok(Self::Init),
            "restarting" => Ok(Self::Restarting),
            "running" => Ok(Self::Running),
            "pending" => Ok(Self::Pending),
            "finishing" => Ok(Self::Finishing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_instance
// ---------------------------------------------------------------------------

/// A persisted workflow instance row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowInstanceRow {
    pub id: i64,
    pub workflow_type: String,
    pub business_id: String,
    pub status: String,
    /// Opaque JSON context shared by the whole instance.
    pub workflow_context: Value,
    /// Opaque external correlation id.
    pub task_id: i64,
    /// Unix seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for inserting a workflow instance; id and timestamps are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewWorkflowInstance {
    pub workflow_type: String,
    pub business_id: String,
    pub status: InstanceStatus,
    pub workflow_context: Value,
    pub task_id: i64,
}

// ---------------------------------------------------------------------------
// task_instance
// ---------------------------------------------------------------------------

/// A persisted task instance row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskInstanceRow {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub task_type: String,
    pub status: String,
    pub fail_count: i64,
    /// Opaque JSON context for this node.
    pub node_context: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for inserting a task instance; id and timestamps are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct NewTaskInstance {
    pub workflow_instance_id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub node_context: Value,
}

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// Pagination window. Defaults to page 1, size 10; `is_no_limit` disables
/// paging entirely.
#[derive(Debug, Clone)]
pub struct Pager {
    pub page: i64,
    pub size: i64,
    pub is_no_limit: bool,
}

impl Default for Pager {
    fn default() -> Self {
        Self {
            page: 1,
            size: 10,
            is_no_limit: false,
        }
    }
}

impl Pager {
    pub fn new(page: i64, size: i64) -> Self {
        Self {
            page,
            size,
            is_no_limit: false,
        }
    }

    pub fn no_limit() -> Self {
        Self {
            is_no_limit: true,
            ..Self::default()
        }
    }

    /// Offset/limit with the documented defaults applied.
    pub fn window(&self) -> (i64, i64) {
        let page = if self.page <= 0 { 1 } else { self.page };
        let size = if self.size <= 0 { 10 } else { self.size };
        ((page - 1) * size, size)
    }
}

/// Filters for querying workflow instances. Unset fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct QueryWorkflowInstanceParams {
    pub id: Option<i64>,
    pub workflow_type_in: Vec<String>,
    pub business_id: Option<String>,
    pub status_in: Vec<InstanceStatus>,
    /// Strictly greater: rows with `id > id_greater_than`.
    pub id_greater_than: Option<i64>,
    pub task_id: Option<i64>,
    pub order_by_id_asc: Option<bool>,
    pub page: Pager,
}

impl QueryWorkflowInstanceParams {
    /// Single-row lookup by primary key.
    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            page: Pager::new(1, 1),
            ..Self::default()
        }
    }
}

/// Filters for querying task instances. Unset fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct QueryTaskInstanceParams {
    pub id: Option<i64>,
    pub workflow_instance_id: Option<i64>,
    pub task_type: Option<String>,
    pub status_in: Vec<TaskStatus>,
    pub id_greater_than: Option<i64>,
    pub order_by_id_asc: Option<bool>,
    pub page: Pager,
}

// ---------------------------------------------------------------------------
// Update parameters
// ---------------------------------------------------------------------------

/// Update for workflow instances. At least one of `id_in` / `status_in` must
/// be set, and at least one field; `limit_max` caps affected rows (0 = no
/// cap). `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct UpdateWorkflowInstanceParams {
    pub id_in: Vec<i64>,
    pub status_in: Vec<InstanceStatus>,
    pub set_status: Option<InstanceStatus>,
    pub set_workflow_context: Option<Value>,
    pub limit_max: usize,
}

impl UpdateWorkflowInstanceParams {
    pub(crate) fn validate(&self) -> Result<(), crate::DbError> {
        if self.id_in.is_empty() && self.status_in.is_empty() {
            return Err(crate::DbError::InvalidParams(
                "update workflow instance requires at least one where predicate".into(),
            ));
        }
        if self.set_status.is_none() && self.set_workflow_context.is_none() {
            return Err(crate::DbError::InvalidParams(
                "update workflow instance has no fields to update".into(),
            ));
        }
        Ok(())
    }
}

/// Update for task instances. `id_in` is mandatory; `limit_max` caps affected
/// rows (0 = no cap). `updated_at` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskInstanceParams {
    pub id_in: Vec<i64>,
    pub set_status: Option<TaskStatus>,
    pub set_node_context: Option<Value>,
    pub set_fail_count: Option<i64>,
    pub limit_max: usize,
}

impl UpdateTaskInstanceParams {
    pub(crate) fn validate(&self) -> Result<(), crate::DbError> {
        if self.id_in.is_empty() {
            return Err(crate::DbError::InvalidParams(
                "update task instance requires an id predicate".into(),
            ));
        }
        if self.set_status.is_none()
            && self.set_node_context.is_none()
            && self.set_fail_count.is_none()
        {
            return Err(crate::DbError::InvalidParams(
                "update task instance has no fields to update".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pager_defaults() {
        assert_eq!(Pager::default().window(), (0, 10));
        assert_eq!(Pager::new(3, 25).window(), (50, 25));
        // zeroed values fall back to the defaults
        assert_eq!(Pager { page: 0, size: 0, is_no_limit: false }.window(), (0, 10));
    }

    #[test]
    fn status_round_trips() {
        for s in ["init", "running", "completed", "failed", "canceled"] {
            let parsed: InstanceStatus = s.parse().expect("parses");
            assert_eq!(parsed.as_str(), s);
        }
        for s in [
            "uncreated",
            "init",
            "restarting",
            "running",
            "pending",
            "finishing",
            "completed",
            "failed",
            "canceled",
        ] {
            let parsed: TaskStatus = s.parse().expect("parses");
            assert_eq!(parsed.as_str(), s);
        }
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Failed.is_terminal());
        assert!(InstanceStatus::Canceled.is_terminal());
        assert!(!InstanceStatus::Running.is_terminal());

        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Restarting.is_terminal());
    }

    #[test]
    fn update_validation() {
        assert!(UpdateWorkflowInstanceParams::default().validate().is_err());
        assert!(UpdateWorkflowInstanceParams {
            id_in: vec![1],
            ..Default::default()
        }
        .validate()
        .is_err()); // no fields
        assert!(UpdateWorkflowInstanceParams {
            id_in: vec![1],
            set_status: Some(InstanceStatus::Running),
            ..Default::default()
        }
        .validate()
        .is_ok());

        assert!(UpdateTaskInstanceParams {
            set_status: Some(TaskStatus::Canceled),
            ..Default::default()
        }
        .validate()
        .is_err()); // id predicate missing
    }
}
