//! The workflow service facade.
//!
//! Public operations: create / run / cancel / restart (node or instance) /
//! inject external event / query. Every mutating operation on an existing
//! instance runs inside the per-instance non-blocking lock; `run_workflow`
//! additionally drives the DAG visitor (see `executor.rs`).

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, instrument};

use db::models::{
    InstanceStatus, NewWorkflowInstance, Pager, QueryTaskInstanceParams,
    QueryWorkflowInstanceParams, TaskInstanceRow, TaskStatus, UpdateTaskInstanceParams,
    UpdateWorkflowInstanceParams, WorkflowInstanceRow,
};
use db::WorkflowRepo;
use workers::context::KEY_NODE_EVENT;
use workers::NodeContext;

use crate::lock::{instance_lock_key, LockScope, WorkflowLock, INSTANCE_LOCK_LEASE};
use crate::models::{
    AddNodeExternalEventParams, CreateWorkflowRequest, RestartWorkflowInstanceParams,
    RestartWorkflowNodeParams, TaskInstanceDetail, TaskNode, WorkflowInstance,
    WorkflowInstanceDetail,
};
use crate::registry::WorkflowRegistry;
use crate::{EngineError, ErrorKind};

/// The engine's service facade. Cheap to clone via the `Arc`s it holds; all
/// state lives in the store, the lock provider and the registry.
pub struct WorkflowService {
    pub(crate) repo: Arc<dyn WorkflowRepo>,
    pub(crate) lock: Arc<dyn WorkflowLock>,
    pub(crate) registry: Arc<WorkflowRegistry>,
}

impl WorkflowService {
    pub fn new(
        repo: Arc<dyn WorkflowRepo>,
        lock: Arc<dyn WorkflowLock>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            repo,
            lock,
            registry,
        }
    }

    // -----------------------------------------------------------------------
    // create
    // -----------------------------------------------------------------------

    /// Create a workflow instance in status `init`, optionally running it
    /// inline.
    ///
    /// A failing definition compile is fatal only when `is_run` is set: the
    /// creating process and the executing process may be different
    /// deployments, and only the executor needs the workers.
    ///
    /// The returned view reflects the instance as created; when `is_run` is
    /// set the stored row may already have progressed past it.
    #[instrument(skip(self, req), fields(workflow_type = %req.workflow_type))]
    pub async fn create_workflow(
        &self,
        req: CreateWorkflowRequest,
    ) -> Result<WorkflowInstance, EngineError> {
        if req.workflow_type.is_empty() {
            return Err(EngineError::ParamInvalid("workflow_type is empty".into()));
        }

        let definition = match self.registry.definition(&req.workflow_type) {
            Ok(definition) => Some(definition),
            Err(e) if req.is_run => {
                return Err(e.context(format!(
                    "cannot run workflow {} at creation",
                    req.workflow_type
                )));
            }
            Err(e) => {
                error!(
                    workflow_type = %req.workflow_type,
                    error = %e,
                    "definition unavailable at creation; an executing process must host the workers"
                );
                None
            }
        };

        let context = NodeContext::from_map(req.context.unwrap_or_default());
        let row = self
            .repo
            .create_workflow_instance(NewWorkflowInstance {
                workflow_type: req.workflow_type.clone(),
                business_id: req.business_id,
                status: InstanceStatus::Init,
                workflow_context: context.to_value(),
                task_id: req.task_id,
            })
            .await?;

        if req.is_run {
            self.run_workflow_scoped(&LockScope::root(), row.id)
                .await
                .map_err(|e| e.context(format!("running workflow instance {} inline", row.id)))?;
        }

        let mut instance = WorkflowInstance::from_row(&row)?;
        instance.definition = definition;
        Ok(instance)
    }

    // -----------------------------------------------------------------------
    // run
    // -----------------------------------------------------------------------

    /// Drive the instance as far as it can currently go: initialize every
    /// node whose predecessors completed, advance every in-flight node one or
    /// more phases, and settle terminal outcomes.
    ///
    /// Fails with `LockFailed` when another caller is executing the same
    /// instance. A run against a terminal instance is a no-op.
    pub async fn run_workflow(&self, instance_id: i64) -> Result<(), EngineError> {
        self.run_workflow_scoped(&LockScope::root(), instance_id).await
    }

    #[instrument(skip(self, scope))]
    pub(crate) async fn run_workflow_scoped(
        &self,
        scope: &LockScope,
        instance_id: i64,
    ) -> Result<(), EngineError> {
        if instance_id <= 0 {
            return Err(EngineError::ParamInvalid(format!(
                "instance id must be positive, got {instance_id}"
            )));
        }
        let row = self.load_instance_row(instance_id).await?;
        let mut instance = WorkflowInstance::from_row(&row)?;
        if instance.status.is_terminal() {
            // terminal instances only move again through an explicit restart
            return Ok(());
        }
        let definition = self
            .registry
            .definition(&instance.workflow_type)
            .map_err(|e| e.context(format!("loading definition for instance {instance_id}")))?;
        instance.definition = Some(definition.clone());

        self.locked(scope, instance_id, move |_scope| {
            Box::pin(async move {
                let rows = self
                    .repo
                    .query_task_instance(&QueryTaskInstanceParams {
                        workflow_instance_id: Some(instance.id),
                        page: Pager::new(1, definition.node_count + 1),
                        ..Default::default()
                    })
                    .await?;
                if rows.len() as i64 > definition.node_count {
                    // invariant violation: at most one row per (instance, task_type)
                    error!(
                        instance_id = instance.id,
                        rows = rows.len(),
                        nodes = definition.node_count,
                        "more task rows than definition nodes, please check"
                    );
                }

                let mut task_map: HashMap<String, TaskNode> = HashMap::new();
                for task_row in &rows {
                    let task = TaskNode::from_row(task_row)?;
                    task_map.insert(task.task_type.clone(), task);
                }

                let result = self
                    .visit_node(&mut instance, &definition, definition.root(), &mut task_map)
                    .await;

                match result {
                    Err(err) if err.kind() == ErrorKind::FailedWithTermination => {
                        self.cascade_cancel(&task_map).await?;
                        Err(err)
                    }
                    other => other,
                }
            })
        })
        .await
    }

    /// After a terminating failure, flip every task still in `init` or
    /// `running` to `canceled`.
    async fn cascade_cancel(&self, task_map: &HashMap<String, TaskNode>) -> Result<(), EngineError> {
        let cancel_ids: Vec<i64> = task_map
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Init | TaskStatus::Running))
            .map(|t| t.id)
            .collect();
        if cancel_ids.is_empty() {
            return Ok(());
        }
        let limit_max = cancel_ids.len();
        self.repo
            .update_task_instance(UpdateTaskInstanceParams {
                id_in: cancel_ids,
                set_status: Some(TaskStatus::Canceled),
                limit_max,
                ..Default::default()
            })
            .await
            .map_err(EngineError::from)
    }

    // -----------------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------------

    /// Cancel a non-terminal instance and all its non-terminal task rows,
    /// transactionally. Cancelling a terminal instance is a no-op.
    ///
    /// A worker hook already in flight in a concurrent process is not
    /// signalled; it observes the cancellation at its next persistence point.
    pub async fn cancel_workflow_instance(&self, instance_id: i64) -> Result<(), EngineError> {
        if instance_id <= 0 {
            return Err(EngineError::ParamInvalid(format!(
                "instance id must be positive, got {instance_id}"
            )));
        }
        let scope = LockScope::root();
        self.locked(&scope, instance_id, move |_scope| {
            Box::pin(async move {
                let row = self.load_instance_row(instance_id).await?;
                let instance = WorkflowInstance::from_row(&row)?;
                if instance.status.is_terminal() {
                    return Ok(());
                }
                self.in_transaction(move |repo| {
                    Box::pin(async move {
                        repo.update_workflow_instance(UpdateWorkflowInstanceParams {
                            id_in: vec![instance_id],
                            status_in: vec![instance.status],
                            set_status: Some(InstanceStatus::Canceled),
                            limit_max: 1,
                            ..Default::default()
                        })
                        .await?;

                        let tasks = load_all_task_rows(repo, instance_id).await?;
                        let cancel_ids: Vec<i64> = tasks
                            .iter()
                            .filter(|t| !row_status_is_terminal(t))
                            .map(|t| t.id)
                            .collect();
                        if !cancel_ids.is_empty() {
                            let limit_max = cancel_ids.len();
                            repo.update_task_instance(UpdateTaskInstanceParams {
                                id_in: cancel_ids,
                                set_status: Some(TaskStatus::Canceled),
                                limit_max,
                                ..Default::default()
                            })
                            .await?;
                        }
                        Ok(())
                    })
                })
                .await
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // restart
    // -----------------------------------------------------------------------

    /// Reset one node and all its transitively reachable descendants to
    /// `restarting`, so the next run re-initializes and re-runs them.
    /// Descendants without rows are ignored. Restarting a node of a terminal
    /// instance requires `is_forced_restart_workflow`, which also flips the
    /// instance back to `running`.
    pub async fn restart_workflow_node(
        &self,
        params: RestartWorkflowNodeParams,
    ) -> Result<(), EngineError> {
        if params.workflow_instance_id <= 0 {
            return Err(EngineError::ParamInvalid(format!(
                "instance id must be positive, got {}",
                params.workflow_instance_id
            )));
        }
        if params.task_type.is_empty() {
            return Err(EngineError::ParamInvalid("task_type is empty".into()));
        }
        let instance_id = params.workflow_instance_id;
        let scope = LockScope::root();
        self.locked(&scope, instance_id, move |_scope| {
            Box::pin(async move {
                let row = self.load_instance_row(instance_id).await?;
                let instance = WorkflowInstance::from_row(&row)?;
                let definition = self.registry.definition(&instance.workflow_type)?;
                let idx = definition.index_of(&params.task_type).ok_or_else(|| {
                    EngineError::UnknownNode(format!(
                        "task_type '{}' is not part of workflow {}",
                        params.task_type, instance.workflow_type
                    ))
                })?;

                let mut reset_types: Vec<String> = definition.descendant_task_types(idx);
                reset_types.push(params.task_type.clone());

                self.in_transaction(move |repo| {
                    Box::pin(async move {
                        if instance.status.is_terminal() {
                            if !params.is_forced_restart_workflow {
                                return Err(EngineError::ParamInvalid(format!(
                                    "workflow instance {instance_id} is terminal; \
                                     set is_forced_restart_workflow to restart it"
                                )));
                            }
                            repo.update_workflow_instance(UpdateWorkflowInstanceParams {
                                id_in: vec![instance_id],
                                set_status: Some(InstanceStatus::Running),
                                limit_max: 1,
                                ..Default::default()
                            })
                            .await?;
                        }

                        let tasks = load_all_task_rows(repo, instance_id).await?;
                        if tasks.is_empty() {
                            // the target node never ran; nothing to reset
                            return Ok(());
                        }
                        let reset_ids: Vec<i64> = tasks
                            .iter()
                            .filter(|t| reset_types.contains(&t.task_type))
                            .map(|t| t.id)
                            .collect();
                        if !reset_ids.is_empty() {
                            let limit_max = reset_ids.len();
                            repo.update_task_instance(UpdateTaskInstanceParams {
                                id_in: reset_ids,
                                set_status: Some(TaskStatus::Restarting),
                                limit_max,
                                ..Default::default()
                            })
                            .await?;
                        }
                        Ok(())
                    })
                })
                .await
            })
        })
        .await
    }

    /// Restart a terminal instance: flip it back to `running`, reset every
    /// `failed`/`canceled` task to `restarting`, and optionally run inline.
    /// A non-terminal instance is left untouched.
    pub async fn restart_workflow_instance(
        &self,
        params: RestartWorkflowInstanceParams,
    ) -> Result<(), EngineError> {
        if params.workflow_instance_id <= 0 {
            return Err(EngineError::ParamInvalid(format!(
                "instance id must be positive, got {}",
                params.workflow_instance_id
            )));
        }
        let instance_id = params.workflow_instance_id;
        let scope = LockScope::root();
        self.locked(&scope, instance_id, move |scope| {
            Box::pin(async move {
                let row = self.load_instance_row(instance_id).await?;
                let instance = WorkflowInstance::from_row(&row)?;
                if !instance.status.is_terminal() {
                    return Ok(());
                }

                self.repo
                    .update_workflow_instance(UpdateWorkflowInstanceParams {
                        id_in: vec![instance_id],
                        set_status: Some(InstanceStatus::Running),
                        limit_max: 1,
                        ..Default::default()
                    })
                    .await?;

                let tasks = load_all_task_rows(self.repo.as_ref(), instance_id).await?;
                let reset_ids: Vec<i64> = tasks
                    .iter()
                    .filter(|t| matches!(
                        TaskStatus::from_str(&t.status),
                        Ok(TaskStatus::Failed) | Ok(TaskStatus::Canceled)
                    ))
                    .map(|t| t.id)
                    .collect();
                if !reset_ids.is_empty() {
                    let limit_max = reset_ids.len();
                    self.repo
                        .update_task_instance(UpdateTaskInstanceParams {
                            id_in: reset_ids,
                            set_status: Some(TaskStatus::Restarting),
                            limit_max,
                            ..Default::default()
                        })
                        .await?;
                }

                if params.is_run {
                    // reentrant: the scope already holds this instance's key
                    self.run_workflow_scoped(&scope, instance_id)
                        .await
                        .map_err(|e| {
                            e.context(format!("running restarted instance {instance_id}"))
                        })?;
                }
                Ok(())
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // external events
    // -----------------------------------------------------------------------

    /// Write an external event into the target task's context under
    /// `node_event`, overwriting any older event. Versioned by `event_ts`:
    /// a submission older than the stored event is rejected.
    pub async fn add_node_external_event(
        &self,
        params: AddNodeExternalEventParams,
    ) -> Result<(), EngineError> {
        if params.workflow_instance_id <= 0 {
            return Err(EngineError::ParamInvalid(format!(
                "instance id must be positive, got {}",
                params.workflow_instance_id
            )));
        }
        if params.task_type.is_empty() {
            return Err(EngineError::ParamInvalid("task_type is empty".into()));
        }
        let instance_id = params.workflow_instance_id;
        let scope = LockScope::root();
        self.locked(&scope, instance_id, move |_scope| {
            Box::pin(async move {
                let rows = self
                    .repo
                    .query_task_instance(&QueryTaskInstanceParams {
                        workflow_instance_id: Some(instance_id),
                        task_type: Some(params.task_type.clone()),
                        order_by_id_asc: Some(false),
                        page: Pager::new(1, 2),
                        ..Default::default()
                    })
                    .await?;
                if rows.is_empty() {
                    return Err(EngineError::TaskInstanceNotFound(format!(
                        "workflow_instance_id: {instance_id}, task_type: {} \
                         (the node may not have initialized yet)",
                        params.task_type
                    )));
                }
                if rows.len() >= 2 {
                    // invariant violation: at most one row per (instance, task_type)
                    return Err(EngineError::Other(format!(
                        "multiple task instances for workflow_instance_id: {instance_id}, \
                         task_type: {}, please check",
                        params.task_type
                    )));
                }

                let mut task = TaskNode::from_row(&rows[0])?;
                if task.status.is_terminal() {
                    return Err(EngineError::Other(format!(
                        "task instance {} is terminal ({}); events can no longer be applied",
                        task.id, task.status
                    )));
                }

                let stored_ts = task
                    .node_context
                    .get_i64(&[KEY_NODE_EVENT, "event_ts"])
                    .unwrap_or(0);
                if stored_ts > params.event.event_ts {
                    return Err(EngineError::Other(format!(
                        "event_ts {} is older than the stored event_ts {stored_ts}, \
                         workflow_instance_id: {instance_id}, task_type: {}",
                        params.event.event_ts, params.task_type
                    )));
                }

                task.node_context.set(
                    &[KEY_NODE_EVENT, "event_content"],
                    params.event.event_content.clone(),
                );
                task.node_context
                    .set(&[KEY_NODE_EVENT, "event_ts"], params.event.event_ts);

                self.repo
                    .update_task_instance(UpdateTaskInstanceParams {
                        id_in: vec![task.id],
                        set_node_context: Some(task.node_context.to_value()),
                        limit_max: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(EngineError::from)
            })
        })
        .await
    }

    // -----------------------------------------------------------------------
    // queries
    // -----------------------------------------------------------------------

    pub async fn count_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<i64, EngineError> {
        self.repo
            .count_workflow_instance(params)
            .await
            .map_err(EngineError::from)
    }

    /// Raw instance rows matching the filters.
    pub async fn query_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<Vec<WorkflowInstanceRow>, EngineError> {
        self.repo
            .query_workflow_instance(params)
            .await
            .map_err(EngineError::from)
    }

    /// Instance details with one task entry per definition node, in
    /// definition order; nodes without rows are reported as `uncreated`.
    /// Instances whose detail cannot be assembled are logged and skipped.
    pub async fn query_workflow_instance_detail(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<Vec<WorkflowInstanceDetail>, EngineError> {
        let rows = self.repo.query_workflow_instance(params).await?;
        let mut details = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.assemble_instance_detail(row).await {
                Ok(detail) => details.push(detail),
                Err(e) => {
                    error!(instance_id = row.id, error = %e, "assembling instance detail failed");
                }
            }
        }
        Ok(details)
    }

    async fn assemble_instance_detail(
        &self,
        row: &WorkflowInstanceRow,
    ) -> Result<WorkflowInstanceDetail, EngineError> {
        let instance = WorkflowInstance::from_row(row)?;
        let definition = self.registry.definition(&instance.workflow_type)?;
        let task_rows = load_all_task_rows(self.repo.as_ref(), instance.id).await?;
        let by_type: HashMap<&str, &TaskInstanceRow> = task_rows
            .iter()
            .map(|t| (t.task_type.as_str(), t))
            .collect();

        let mut tasks = Vec::with_capacity(definition.nodes().len());
        for node in definition.nodes() {
            let pre_nodes_keys = node
                .pre_nodes
                .iter()
                .map(|&i| definition.node(i).task_type.clone())
                .collect();
            let next_nodes_keys = node
                .next_nodes
                .iter()
                .map(|&i| definition.node(i).task_type.clone())
                .collect();

            let detail = match by_type.get(node.task_type.as_str()) {
                Some(task_row) => {
                    let task = TaskNode::from_row(task_row)?;
                    TaskInstanceDetail {
                        id: Some(task.id),
                        workflow_instance_id: instance.id,
                        task_type: task.task_type,
                        task_name: node.task_name.clone(),
                        status: task.status,
                        node_context: Some(task.node_context),
                        created_at: Some(task.created_at),
                        updated_at: Some(task.updated_at),
                        pre_nodes_keys,
                        next_nodes_keys,
                    }
                }
                None => TaskInstanceDetail {
                    id: None,
                    workflow_instance_id: instance.id,
                    task_type: node.task_type.clone(),
                    task_name: node.task_name.clone(),
                    status: TaskStatus::Uncreated,
                    node_context: None,
                    created_at: None,
                    updated_at: None,
                    pre_nodes_keys,
                    next_nodes_keys,
                },
            };
            tasks.push(detail);
        }

        Ok(WorkflowInstanceDetail {
            id: instance.id,
            workflow_type: instance.workflow_type,
            business_id: instance.business_id,
            status: instance.status,
            workflow_context: instance.workflow_context,
            created_at: instance.created_at,
            updated_at: instance.updated_at,
            tasks,
        })
    }

    // -----------------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------------

    pub(crate) async fn load_instance_row(
        &self,
        instance_id: i64,
    ) -> Result<WorkflowInstanceRow, EngineError> {
        let rows = self
            .repo
            .query_workflow_instance(&QueryWorkflowInstanceParams::by_id(instance_id))
            .await?;
        rows.into_iter().next().ok_or_else(|| {
            EngineError::InstanceNotFound(format!("workflow_instance_id: {instance_id}"))
        })
    }

    /// Run `f` inside the instance's critical section. Reentrant: if `scope`
    /// already holds the key, `f` runs without re-acquisition and without
    /// releasing on exit.
    pub(crate) async fn locked<'a, T, F>(
        &'a self,
        scope: &LockScope,
        instance_id: i64,
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce(LockScope) -> BoxFuture<'a, Result<T, EngineError>>,
    {
        let key = instance_lock_key(instance_id);
        if scope.holds(&key) {
            return f(scope.clone()).await;
        }
        let token = self
            .lock
            .try_acquire(&key, INSTANCE_LOCK_LEASE)
            .await
            .map_err(|e| e.context(format!("acquiring lock for instance {instance_id}")))?;
        let result = f(scope.child(&key)).await;
        self.lock.release(&key, &token).await;
        result
    }

    /// Run `f` inside a store transaction, tunnelling `EngineError` through
    /// the store's boxed transaction error and back out.
    pub(crate) async fn in_transaction<'a, F>(&'a self, f: F) -> Result<(), EngineError>
    where
        F: for<'b> FnOnce(&'b dyn WorkflowRepo) -> BoxFuture<'b, Result<(), EngineError>>
            + Send
            + 'a,
    {
        let result = self
            .repo
            .transaction(Box::new(move |repo| {
                let fut = f(repo);
                Box::pin(async move {
                    fut.await
                        .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
                })
            }))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(db::DbError::Tx(boxed)) => match boxed.downcast::<EngineError>() {
                Ok(engine_err) => Err(*engine_err),
                Err(other) => Err(EngineError::Db(db::DbError::Tx(other))),
            },
            Err(e) => Err(e.into()),
        }
    }
}

/// Load every task row of an instance with a paging loop, so instances are
/// not bounded by a single query page.
pub(crate) async fn load_all_task_rows(
    repo: &dyn WorkflowRepo,
    instance_id: i64,
) -> Result<Vec<TaskInstanceRow>, EngineError> {
    const FETCH_SIZE: i64 = 100;
    let mut page = 1;
    let mut all = Vec::new();
    loop {
        let rows = repo
            .query_task_instance(&QueryTaskInstanceParams {
                workflow_instance_id: Some(instance_id),
                page: Pager::new(page, FETCH_SIZE),
                ..Default::default()
            })
            .await?;
        let fetched = rows.len();
        all.extend(rows);
        if fetched < FETCH_SIZE as usize {
            return Ok(all);
        }
        page += 1;
    }
}

/// Whether a raw row's status parses to a terminal task status. Unknown
/// statuses count as non-terminal so they are still swept by cancellation.
fn row_status_is_terminal(row: &TaskInstanceRow) -> bool {
    TaskStatus::from_str(&row.status)
        .map(|s| s.is_terminal())
        .unwrap_or(false)
}
