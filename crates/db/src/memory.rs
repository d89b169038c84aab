//! In-memory `WorkflowRepo` implementation.
//!
//! Backs tests and database-free embedding. Rows live in plain vectors behind
//! a mutex; ids are assigned from a monotonic counter. `transaction` takes a
//! snapshot of the whole state and restores it if the closure fails — good
//! enough for the single-writer-per-instance access pattern the engine
//! guarantees, not a general-purpose MVCC store.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::models::{
    NewTaskInstance, NewWorkflowInstance, Pager, QueryTaskInstanceParams,
    QueryWorkflowInstanceParams, TaskInstanceRow, UpdateTaskInstanceParams,
    UpdateWorkflowInstanceParams, WorkflowInstanceRow,
};
use crate::repo::{TxFn, WorkflowRepo};
use crate::{unix_now, DbError};

#[derive(Default, Clone)]
struct State {
    instances: Vec<WorkflowInstanceRow>,
    tasks: Vec<TaskInstanceRow>,
    next_instance_id: i64,
    next_task_id: i64,
}

#[derive(Default)]
struct Inner {
    state: State,
    /// Depth of nested `transaction` calls; only the outermost snapshots.
    tx_depth: u32,
    snapshot: Option<State>,
}

/// In-process store.
#[derive(Default)]
pub struct MemoryRepo {
    inner: Mutex<Inner>,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

fn instance_matches(row: &WorkflowInstanceRow, p: &QueryWorkflowInstanceParams) -> bool {
    if let Some(id) = p.id {
        if row.id != id {
            return false;
        }
    }
    if !p.workflow_type_in.is_empty() && !p.workflow_type_in.contains(&row.workflow_type) {
        return false;
    }
    if let Some(business_id) = &p.business_id {
        if &row.business_id != business_id {
            return false;
        }
    }
    if !p.status_in.is_empty() && !p.status_in.iter().any(|s| s.as_str() == row.status) {
        return false;
    }
    if let Some(floor) = p.id_greater_than {
        if row.id <= floor {
            return false;
        }
    }
    if let Some(task_id) = p.task_id {
        if row.task_id != task_id {
            return false;
        }
    }
    true
}

fn task_matches(row: &TaskInstanceRow, p: &QueryTaskInstanceParams) -> bool {
    if let Some(id) = p.id {
        if row.id != id {
            return false;
        }
    }
    if let Some(instance_id) = p.workflow_instance_id {
        if row.workflow_instance_id != instance_id {
            return false;
        }
    }
    if let Some(task_type) = &p.task_type {
        if &row.task_type != task_type {
            return false;
        }
    }
    if !p.status_in.is_empty() && !p.status_in.iter().any(|s| s.as_str() == row.status) {
        return false;
    }
    if let Some(floor) = p.id_greater_than {
        if row.id <= floor {
            return false;
        }
    }
    true
}

fn order_and_page<T, F: Fn(&T) -> i64>(mut rows: Vec<T>, id_of: F, order: Option<bool>, page: &Pager) -> Vec<T> {
    match order {
        Some(true) => rows.sort_by_key(|r| id_of(r)),
        Some(false) => rows.sort_by_key(|r| std::cmp::Reverse(id_of(r))),
        None => {}
    }
    if page.is_no_limit {
        return rows;
    }
    let (offset, limit) = page.window();
    rows.into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect()
}

#[async_trait]
impl WorkflowRepo for MemoryRepo {
    async fn create_workflow_instance(
        &self,
        row: NewWorkflowInstance,
    ) -> Result<WorkflowInstanceRow, DbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.next_instance_id += 1;
        let now = unix_now();
        let row = WorkflowInstanceRow {
            id: inner.state.next_instance_id,
            workflow_type: row.workflow_type,
            business_id: row.business_id,
            status: row.status.as_str().to_string(),
            workflow_context: row.workflow_context,
            task_id: row.task_id,
            created_at: now,
            updated_at: now,
        };
        inner.state.instances.push(row.clone());
        Ok(row)
    }

    async fn create_task_instance(
        &self,
        row: NewTaskInstance,
    ) -> Result<TaskInstanceRow, DbError> {
        let mut inner = self.inner.lock().unwrap();
        inner.state.next_task_id += 1;
        let now = unix_now();
        let row = TaskInstanceRow {
            id: inner.state.next_task_id,
            workflow_instance_id: row.workflow_instance_id,
            task_type: row.task_type,
            status: row.status.as_str().to_string(),
            fail_count: 0,
            node_context: row.node_context,
            created_at: now,
            updated_at: now,
        };
        inner.state.tasks.push(row.clone());
        Ok(row)
    }

    async fn query_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<Vec<WorkflowInstanceRow>, DbError> {
        let inner = self.inner.lock().unwrap();
        let rows: Vec<_> = inner
            .state
            .instances
            .iter()
            .filter(|r| instance_matches(r, params))
            .cloned()
            .collect();
        Ok(order_and_page(rows, |r| r.id, params.order_by_id_asc, &params.page))
    }

    async fn count_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<i64, DbError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .state
            .instances
            .iter()
            .filter(|r| instance_matches(r, params))
            .count() as i64)
    }

    async fn query_task_instance(
        &self,
        params: &QueryTaskInstanceParams,
    ) -> Result<Vec<TaskInstanceRow>, DbError> {
        let inner = self.inner.lock().unwrap();
        let rows: Vec<_> = inner
            .state
            .tasks
            .iter()
            .filter(|r| task_matches(r, params))
            .cloned()
            .collect();
        Ok(order_and_page(rows, |r| r.id, params.order_by_id_asc, &params.page))
    }

    async fn update_workflow_instance(
        &self,
        params: UpdateWorkflowInstanceParams,
    ) -> Result<(), DbError> {
        params.validate()?;
        let mut inner = self.inner.lock().unwrap();
        let now = unix_now();
        let mut touched = 0usize;
        for row in inner.state.instances.iter_mut() {
            if params.limit_max > 0 && touched >= params.limit_max {
                break;
            }
            if !params.id_in.is_empty() && !params.id_in.contains(&row.id) {
                continue;
            }
            if !params.status_in.is_empty()
                && !params.status_in.iter().any(|s| s.as_str() == row.status)
            {
                continue;
            }
            if let Some(status) = params.set_status {
                row.status = status.as_str().to_string();
            }
            if let Some(ctx) = &params.set_workflow_context {
                row.workflow_context = ctx.clone();
            }
            row.updated_at = now;
            touched += 1;
        }
        Ok(())
    }

    async fn update_task_instance(
        &self,
        params: UpdateTaskInstanceParams,
    ) -> Result<(), DbError> {
        params.validate()?;
        let mut inner = self.inner.lock().unwrap();
        let now = unix_now();
        let mut touched = 0usize;
        for row in inner.state.tasks.iter_mut() {
            if params.limit_max > 0 && touched >= params.limit_max {
                break;
            }
            if !params.id_in.contains(&row.id) {
                continue;
            }
            if let Some(status) = params.set_status {
                row.status = status.as_str().to_string();
            }
            if let Some(ctx) = &params.set_node_context {
                row.node_context = ctx.clone();
            }
            if let Some(fail_count) = params.set_fail_count {
                row.fail_count = fail_count;
            }
            row.updated_at = now;
            touched += 1;
        }
        Ok(())
    }

    async fn transaction<'a>(&'a self, f: TxFn<'a>) -> Result<(), DbError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.tx_depth == 0 {
                inner.snapshot = Some(inner.state.clone());
            }
            inner.tx_depth += 1;
        }
        let result = f(self).await;
        let mut inner = self.inner.lock().unwrap();
        inner.tx_depth -= 1;
        match result {
            Ok(()) => {
                if inner.tx_depth == 0 {
                    inner.snapshot = None;
                }
                Ok(())
            }
            Err(e) => {
                if inner.tx_depth == 0 {
                    if let Some(snapshot) = inner.snapshot.take() {
                        inner.state = snapshot;
                    }
                }
                Err(DbError::Tx(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceStatus, TaskStatus};
    use serde_json::json;

    fn new_instance(workflow_type: &str, business_id: &str) -> NewWorkflowInstance {
        NewWorkflowInstance {
            workflow_type: workflow_type.into(),
            business_id: business_id.into(),
            status: InstanceStatus::Init,
            workflow_context: json!({}),
            task_id: 0,
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let repo = MemoryRepo::new();
        let a = repo
            .create_workflow_instance(new_instance("wf", "A"))
            .await
            .unwrap();
        let b = repo
            .create_workflow_instance(new_instance("wf", "B"))
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, "init");
        assert!(a.created_at > 0);
    }

    #[tokio::test]
    async fn query_filters_and_pages() {
        let repo = MemoryRepo::new();
        for i in 0..25 {
            repo.create_workflow_instance(new_instance("wf", &format!("B-{i}")))
                .await
                .unwrap();
        }
        repo.create_workflow_instance(new_instance("other", "X"))
            .await
            .unwrap();

        // default page = first 10
        let page1 = repo
            .query_workflow_instance(&QueryWorkflowInstanceParams {
                workflow_type_in: vec!["wf".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page1.len(), 10);

        // strict greater-than excludes the boundary id
        let after = repo
            .query_workflow_instance(&QueryWorkflowInstanceParams {
                id_greater_than: Some(page1[9].id),
                page: Pager::no_limit(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(after.iter().all(|r| r.id > page1[9].id));

        // descending order
        let desc = repo
            .query_workflow_instance(&QueryWorkflowInstanceParams {
                order_by_id_asc: Some(false),
                page: Pager::new(1, 3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(desc.windows(2).all(|w| w[0].id > w[1].id));

        let count = repo
            .count_workflow_instance(&QueryWorkflowInstanceParams {
                workflow_type_in: vec!["wf".into()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(count, 25);
    }

    #[tokio::test]
    async fn update_requires_predicates() {
        let repo = MemoryRepo::new();
        let err = repo
            .update_workflow_instance(UpdateWorkflowInstanceParams {
                set_status: Some(InstanceStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParams(_)));

        let err = repo
            .update_task_instance(UpdateTaskInstanceParams {
                set_status: Some(TaskStatus::Canceled),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn update_honors_limit_max() {
        let repo = MemoryRepo::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                repo.create_workflow_instance(new_instance("wf", "B"))
                    .await
                    .unwrap()
                    .id,
            );
        }
        repo.update_workflow_instance(UpdateWorkflowInstanceParams {
            id_in: ids.clone(),
            set_status: Some(InstanceStatus::Running),
            limit_max: 2,
            ..Default::default()
        })
        .await
        .unwrap();

        let rows = repo
            .query_workflow_instance(&QueryWorkflowInstanceParams {
                page: Pager::no_limit(),
                ..Default::default()
            })
            .await
            .unwrap();
        let running = rows.iter().filter(|r| r.status == "running").count();
        assert_eq!(running, 2);
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let repo = MemoryRepo::new();
        repo.create_workflow_instance(new_instance("wf", "KEEP"))
            .await
            .unwrap();

        let result = repo
            .transaction(Box::new(|r| {
                Box::pin(async move {
                    r.create_workflow_instance(new_instance("wf", "DROPPED"))
                        .await
                        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
                    Err("boom".into())
                })
            }))
            .await;
        assert!(matches!(result, Err(DbError::Tx(_))));

        let count = repo
            .count_workflow_instance(&QueryWorkflowInstanceParams::default())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn nested_transaction_reuses_outer() {
        let repo = MemoryRepo::new();
        repo.transaction(Box::new(|r| {
            Box::pin(async move {
                r.create_workflow_instance(new_instance("wf", "OUTER"))
                    .await
                    .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
                r.transaction(Box::new(|r| {
                    Box::pin(async move {
                        r.create_workflow_instance(new_instance("wf", "INNER"))
                            .await
                            .map_err(|e| {
                                Box::new(e) as Box<dyn std::error::Error + Send + Sync>
                            })?;
                        Ok(())
                    })
                }))
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
                Ok(())
            })
        }))
        .await
        .unwrap();

        let count = repo
            .count_workflow_instance(&QueryWorkflowInstanceParams::default())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }
}
