//! The DAG visitor and the per-task phase machine.
//!
//! `visit_node` walks the compiled graph recursively from `root`, deciding
//! for each node whether to initialize, advance, skip, or abort it. The
//! guarantees it upholds:
//!
//! - a task row is created only after every predecessor row is `completed`;
//! - a terminal task never runs again (short of an explicit restart);
//! - successors are visited whenever the current node advanced cleanly in
//!   this call or was already `completed`.
//!
//! `run_phases` advances a single task through
//! `running → pending → finishing → completed`, persisting status and context
//! at each step. `handle_task_error` is the single place where error kinds
//! are rewritten: a node past its wait deadline and a node out of retry
//! budget both become `FailedWithTermination`, which the visitor propagates
//! to trigger cascade-cancellation in `run_workflow`.
//!
//! Note for maintainers: the visitor recurses; diamond joins make it reach a
//! node once per incoming edge. That is safe because every decision starts
//! from the task map, and re-initialization is guarded by it.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

use db::models::{
    InstanceStatus, NewTaskInstance, TaskStatus, UpdateTaskInstanceParams,
    UpdateWorkflowInstanceParams,
};
use workers::context::{
    KEY_LAST_ERROR, KEY_LAST_ERROR_TIME, KEY_PRE_NODE_CONTEXT, KEY_REASON, KEY_SYSTEM,
    KEY_WORKFLOW_CONTEXT,
};
use workers::{NodeContext, TaskWorker};

use crate::dag::{TaskNodeDefinition, WorkflowDefinition, END_TASK_TYPE};
use crate::models::{TaskNode, WorkflowInstance};
use crate::service::WorkflowService;
use crate::{EngineError, ErrorKind};

impl WorkflowService {
    /// Visit `idx` and, transitively, every successor that becomes reachable.
    ///
    /// Returns `Err` only for workflow-terminating failures; every other
    /// error is logged here and converted into "abandon this subtree for this
    /// run".
    pub(crate) fn visit_node<'a>(
        &'a self,
        instance: &'a mut WorkflowInstance,
        definition: &'a WorkflowDefinition,
        idx: usize,
        task_map: &'a mut HashMap<String, TaskNode>,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            let node = definition.node(idx);
            let current = task_map.get(&node.task_type).map(|t| t.status);

            let proceed = match current {
                // No row yet: initialize once every predecessor completed.
                None => {
                    let Some(new_context) = build_node_context(instance, definition, idx, task_map)
                    else {
                        return Ok(());
                    };
                    if idx == definition.root() {
                        instance.status = InstanceStatus::Running;
                        self.update_instance_status(instance.id, InstanceStatus::Running)
                            .await
                            .map_err(|e| {
                                e.context(format!(
                                    "flipping instance {} to running",
                                    instance.id
                                ))
                            })?;
                    }
                    let row = self
                        .repo
                        .create_task_instance(NewTaskInstance {
                            workflow_instance_id: instance.id,
                            task_type: node.task_type.clone(),
                            status: TaskStatus::Running,
                            node_context: new_context.to_value(),
                        })
                        .await
                        .map_err(EngineError::from)?;
                    let task = TaskNode::from_row(&row)?;
                    task_map.insert(node.task_type.clone(), task);
                    self.advance_task(instance, node, task_map).await?
                }

                // Done: nothing to run, but the subtree below may have work.
                Some(TaskStatus::Completed) => true,

                // A settled failure or cancellation terminates the workflow.
                Some(status @ (TaskStatus::Failed | TaskStatus::Canceled)) => {
                    if matches!(
                        instance.status,
                        InstanceStatus::Canceled | InstanceStatus::Failed
                    ) {
                        return Err(EngineError::FailedWithTermination(format!(
                            "task '{}' is {status} and instance {} is already terminal",
                            node.task_type, instance.id
                        )));
                    }
                    let flip_to = if status == TaskStatus::Canceled {
                        InstanceStatus::Canceled
                    } else {
                        InstanceStatus::Failed
                    };
                    let original = instance.status;
                    instance.status = flip_to;
                    if let Err(e) = self.update_instance_status(instance.id, flip_to).await {
                        instance.status = original;
                        error!(
                            instance_id = instance.id,
                            error = %e,
                            "failed to persist instance status after settled task failure"
                        );
                    }
                    return Err(EngineError::FailedWithTermination(format!(
                        "task '{}' is {status}, terminating instance {}",
                        node.task_type, instance.id
                    )));
                }

                // The row exists but must be re-initialized before running.
                Some(TaskStatus::Restarting) => {
                    let Some(new_context) = build_node_context(instance, definition, idx, task_map)
                    else {
                        return Ok(());
                    };
                    let Some(task) = task_map.get_mut(&node.task_type) else {
                        return Ok(());
                    };
                    task.status = TaskStatus::Running;
                    task.node_context = new_context;
                    self.persist_task(task, true, true, false)
                        .await
                        .map_err(|e| {
                            e.context(format!("re-initializing task '{}'", node.task_type))
                        })?;
                    self.advance_task(instance, node, task_map).await?
                }

                // In-flight (or an `init` row, which the phase machine
                // leaves untouched): advance as far as possible.
                Some(_) => self.advance_task(instance, node, task_map).await?,
            };

            if proceed {
                for &next in &node.next_nodes {
                    self.visit_node(instance, definition, next, task_map)
                        .await
                        .map_err(|e| {
                            e.context(format!("visiting successors of '{}'", node.task_type))
                        })?;
                }
            }
            Ok(())
        })
    }

    /// Run the phase machine on the node's task and fold its outcome into the
    /// visitor's control flow: `Ok(true)` advance was clean (visit
    /// successors), `Ok(false)` soft failure (abandon the subtree for this
    /// run), `Err` workflow termination.
    async fn advance_task(
        &self,
        instance: &mut WorkflowInstance,
        node: &TaskNodeDefinition,
        task_map: &mut HashMap<String, TaskNode>,
    ) -> Result<bool, EngineError> {
        let Some(task) = task_map.get_mut(&node.task_type) else {
            return Ok(false);
        };
        match self.task_run(instance, node, task).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::FailedWithTermination => Err(err.context(
                format!("task '{}' terminated instance {}", node.task_type, instance.id),
            )),
            Err(err) => {
                if err.is_serious() {
                    error!(
                        instance_id = instance.id,
                        task_type = %node.task_type,
                        error = %err,
                        "task run failed"
                    );
                } else {
                    warn!(
                        instance_id = instance.id,
                        task_type = %node.task_type,
                        error = %err,
                        "task run failed"
                    );
                }
                Ok(false)
            }
        }
    }

    async fn task_run(
        &self,
        instance: &mut WorkflowInstance,
        node: &TaskNodeDefinition,
        task: &mut TaskNode,
    ) -> Result<(), EngineError> {
        match self.run_phases(instance, node, task).await {
            Ok(()) => Ok(()),
            Err(err) => self.handle_task_error(instance, node, task, err).await,
        }
    }

    /// Advance the task through as many phases as its current status allows.
    async fn run_phases(
        &self,
        instance: &mut WorkflowInstance,
        node: &TaskNodeDefinition,
        task: &mut TaskNode,
    ) -> Result<(), EngineError> {
        if task.status == TaskStatus::Running {
            run_hook(node.worker.as_ref(), Hook::Run, &mut task.node_context)
                .await
                .map_err(|e| e.context(format!("run hook of '{}'", node.task_type)))?;
            task.status = TaskStatus::Pending;
            self.persist_task(task, true, true, false).await?;
        }

        if task.status == TaskStatus::Pending {
            run_hook(node.worker.as_ref(), Hook::WaitCheck, &mut task.node_context)
                .await
                .map_err(|e| e.context(format!("wait_check hook of '{}'", node.task_type)))?;
            task.status = TaskStatus::Finishing;
            self.persist_task(task, true, true, false).await?;
        }

        if task.status == TaskStatus::Finishing {
            task.status = TaskStatus::Completed;
            self.persist_task(task, true, false, false).await?;
            if node.task_type == END_TASK_TYPE {
                // every path reached the sink: the instance is done
                instance.status = InstanceStatus::Completed;
                self.update_instance_status(instance.id, InstanceStatus::Completed)
                    .await
                    .map_err(|e| {
                        e.context(format!("completing instance {}", instance.id))
                    })?;
            }
        }

        Ok(())
    }

    /// The single rewrite point for task errors.
    ///
    /// Always records the error under `system`; then applies the timeout
    /// override, the retry bound, and finally dispatches on the (possibly
    /// rewritten) kind. Returns `Ok` for outcomes the visitor should treat
    /// as settled (not-ready, continue-on-failure), `Err` otherwise.
    async fn handle_task_error(
        &self,
        instance: &mut WorkflowInstance,
        node: &TaskNodeDefinition,
        task: &mut TaskNode,
        mut err: EngineError,
    ) -> Result<(), EngineError> {
        append_system_error(&mut task.node_context, &err);

        let now = chrono::Utc::now().timestamp();
        if node.max_wait_time_ts > 0 && now - task.created_at > node.max_wait_time_ts {
            err = EngineError::FailedWithTermination(format!(
                "task '{}' exceeded its wait deadline of {}s: {err}",
                node.task_type, node.max_wait_time_ts
            ));
            let reason = task
                .node_context
                .get_str(&[KEY_SYSTEM, KEY_REASON])
                .unwrap_or_default();
            if reason.is_empty() {
                task.node_context
                    .set(&[KEY_SYSTEM, KEY_REASON], "task node execution timeout");
            }
        }

        match err.kind() {
            ErrorKind::NotReady => {
                // normal business behavior: keep whatever the hook wrote and
                // let a later run poll again
                self.persist_task(task, false, true, false)
                    .await
                    .map_err(|e| e.context("persisting context after not-ready"))
            }

            ErrorKind::FailedWithContinue => {
                task.status = TaskStatus::Completed;
                task.fail_count += 1;
                self.persist_task(task, true, true, true)
                    .await
                    .map_err(|e| e.context("persisting continue-on-failure completion"))
            }

            _ => {
                if node.fail_max_count > 0
                    && task.fail_count + 1 >= node.fail_max_count
                    && err.kind() != ErrorKind::FailedWithTermination
                {
                    err = EngineError::FailedWithTermination(format!(
                        "task '{}' reached its failure bound of {}: {err}",
                        node.task_type, node.fail_max_count
                    ));
                    append_system_error(&mut task.node_context, &err);
                }

                if err.kind() == ErrorKind::FailedWithTermination {
                    let original = task.status;
                    task.status = TaskStatus::Failed;
                    task.fail_count += 1;
                    if let Err(persist) = self.persist_task(task, true, true, true).await {
                        task.status = original;
                        return Err(err.context(format!(
                            "persisting failed task also failed: {persist}"
                        )));
                    }

                    if matches!(
                        instance.status,
                        InstanceStatus::Canceled | InstanceStatus::Failed
                    ) {
                        return Err(err);
                    }
                    let original = instance.status;
                    instance.status = InstanceStatus::Failed;
                    if let Err(persist) = self
                        .update_instance_status(instance.id, InstanceStatus::Failed)
                        .await
                    {
                        instance.status = original;
                        error!(
                            instance_id = instance.id,
                            error = %persist,
                            "failed to persist instance failure"
                        );
                    }
                    return Err(err);
                }

                // anything else: count the failure, keep the context, retry
                // on a later run
                task.fail_count += 1;
                match self.persist_task(task, false, true, true).await {
                    Ok(()) => Err(err),
                    Err(persist) => Err(err.context(format!(
                        "persisting failure count also failed: {persist}"
                    ))),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Persistence helpers
    // -----------------------------------------------------------------------

    pub(crate) async fn persist_task(
        &self,
        task: &TaskNode,
        set_status: bool,
        set_context: bool,
        set_fail_count: bool,
    ) -> Result<(), EngineError> {
        self.repo
            .update_task_instance(UpdateTaskInstanceParams {
                id_in: vec![task.id],
                set_status: set_status.then_some(task.status),
                set_node_context: set_context.then(|| task.node_context.to_value()),
                set_fail_count: set_fail_count.then_some(task.fail_count),
                limit_max: 1,
            })
            .await
            .map_err(EngineError::from)
    }

    pub(crate) async fn update_instance_status(
        &self,
        instance_id: i64,
        status: InstanceStatus,
    ) -> Result<(), EngineError> {
        self.repo
            .update_workflow_instance(UpdateWorkflowInstanceParams {
                id_in: vec![instance_id],
                set_status: Some(status),
                limit_max: 1,
                ..Default::default()
            })
            .await
            .map_err(EngineError::from)
    }
}

// ---------------------------------------------------------------------------
// Worker hook invocation
// ---------------------------------------------------------------------------

enum Hook {
    Run,
    WaitCheck,
}

/// Invoke one worker hook, converting a panic into an error so a misbehaving
/// worker cannot take the whole run down.
async fn run_hook(
    worker: &dyn TaskWorker,
    hook: Hook,
    ctx: &mut NodeContext,
) -> Result<(), EngineError> {
    let outcome = match hook {
        Hook::Run => AssertUnwindSafe(worker.run(ctx)).catch_unwind().await,
        Hook::WaitCheck => AssertUnwindSafe(worker.wait_check(ctx)).catch_unwind().await,
    };
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(worker_err)) => Err(EngineError::from(worker_err)),
        Err(payload) => Err(EngineError::Other(format!(
            "worker hook panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// NodeContext assembly
// ---------------------------------------------------------------------------

/// Build the context for a node about to (re)initialize, or `None` when any
/// predecessor is missing or not yet `completed`.
///
/// Each predecessor's context is flattened one level: the successor sees the
/// predecessor's own fields under `pre_node_context.<task_type>`, but not the
/// predecessor's predecessors, its copy of the workflow context, or its
/// engine metadata. The workflow context is re-materialized from the
/// instance.
fn build_node_context(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    idx: usize,
    task_map: &HashMap<String, TaskNode>,
) -> Option<NodeContext> {
    let node = definition.node(idx);
    let mut pre_contexts = Map::new();
    for &pre_idx in &node.pre_nodes {
        let pre_type = &definition.node(pre_idx).task_type;
        let pre_task = task_map.get(pre_type)?;
        if pre_task.status != TaskStatus::Completed {
            return None;
        }
        let mut projected = pre_task.node_context.as_map().clone();
        projected.remove(KEY_PRE_NODE_CONTEXT);
        projected.remove(KEY_WORKFLOW_CONTEXT);
        projected.remove(KEY_SYSTEM);
        pre_contexts.insert(pre_task.task_type.clone(), Value::Object(projected));
    }

    let mut context = NodeContext::new();
    context.set(&[KEY_PRE_NODE_CONTEXT], Value::Object(pre_contexts));
    context.set(&[KEY_WORKFLOW_CONTEXT], instance.workflow_context.to_value());
    Some(context)
}

fn append_system_error(ctx: &mut NodeContext, err: &EngineError) {
    ctx.set(&[KEY_SYSTEM, KEY_LAST_ERROR], err.to_string());
    ctx.set(
        &[KEY_SYSTEM, KEY_LAST_ERROR_TIME],
        chrono::Utc::now().to_rfc3339(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(17usize);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }

    #[test]
    fn system_error_lands_under_system() {
        let mut ctx = NodeContext::new();
        append_system_error(&mut ctx, &EngineError::Other("boom".into()));
        assert_eq!(ctx.get_str(&[KEY_SYSTEM, KEY_LAST_ERROR]), Some("boom"));
        assert!(ctx.get_str(&[KEY_SYSTEM, KEY_LAST_ERROR_TIME]).is_some());
        // nothing leaked to the top level
        assert!(ctx.get(&[KEY_LAST_ERROR]).is_none());
    }

    #[test]
    fn projected_predecessor_context_drops_reserved_keys() {
        let mut pre_ctx = NodeContext::new();
        pre_ctx.set(&["result"], json!({"rows": 3}));
        pre_ctx.set(&[KEY_PRE_NODE_CONTEXT, "earlier"], json!({"x": 1}));
        pre_ctx.set(&[KEY_WORKFLOW_CONTEXT, "shared"], "s");
        pre_ctx.set(&[KEY_SYSTEM, KEY_LAST_ERROR], "old error");

        let mut projected = pre_ctx.as_map().clone();
        projected.remove(KEY_PRE_NODE_CONTEXT);
        projected.remove(KEY_WORKFLOW_CONTEXT);
        projected.remove(KEY_SYSTEM);

        assert!(projected.contains_key("result"));
        assert!(!projected.contains_key(KEY_PRE_NODE_CONTEXT));
        assert!(!projected.contains_key(KEY_WORKFLOW_CONTEXT));
        assert!(!projected.contains_key(KEY_SYSTEM));
    }
}
