//! The `WorkflowRepo` contract — durable CRUD for instance and task rows,
//! plus a transaction scope.
//!
//! The engine only ever talks to this trait; the concrete store (Postgres,
//! in-memory, anything else) is wired in at construction time.

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::models::{
    NewTaskInstance, NewWorkflowInstance, QueryTaskInstanceParams, QueryWorkflowInstanceParams,
    TaskInstanceRow, UpdateTaskInstanceParams, UpdateWorkflowInstanceParams, WorkflowInstanceRow,
};
use crate::DbError;

/// A transaction body. It receives a repository view bound to the transaction
/// and must perform all its persistence through that view. The error is boxed
/// so domain errors can pass through the store layer untouched (see
/// [`DbError::Tx`]).
pub type TxFn<'a> = Box<
    dyn for<'b> FnOnce(
            &'b dyn WorkflowRepo,
        ) -> BoxFuture<'b, Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + 'a,
>;

#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    /// Insert a workflow instance; the store assigns id and timestamps.
    async fn create_workflow_instance(
        &self,
        row: NewWorkflowInstance,
    ) -> Result<WorkflowInstanceRow, DbError>;

    /// Insert a task instance; the store assigns id and timestamps.
    async fn create_task_instance(&self, row: NewTaskInstance)
        -> Result<TaskInstanceRow, DbError>;

    async fn query_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<Vec<WorkflowInstanceRow>, DbError>;

    async fn count_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<i64, DbError>;

    async fn query_task_instance(
        &self,
        params: &QueryTaskInstanceParams,
    ) -> Result<Vec<TaskInstanceRow>, DbError>;

    /// Requires at least one where predicate (`id_in` or `status_in`).
    async fn update_workflow_instance(
        &self,
        params: UpdateWorkflowInstanceParams,
    ) -> Result<(), DbError>;

    /// Requires `id_in`.
    async fn update_task_instance(&self, params: UpdateTaskInstanceParams)
        -> Result<(), DbError>;

    /// Run `f` within an atomic scope. A nested `transaction` call on the
    /// repository view handed to `f` reuses the outer transaction.
    async fn transaction<'a>(&'a self, f: TxFn<'a>) -> Result<(), DbError>;
}
