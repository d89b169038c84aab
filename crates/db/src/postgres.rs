//! Postgres `WorkflowRepo` implementation.
//!
//! Predicates arrive as optional fields on the parameter objects, so queries
//! are assembled dynamically with `QueryBuilder`. `limit_max` on updates is
//! expressed through an id-subquery because Postgres has no `UPDATE … LIMIT`.
//!
//! Transactions hand the closure a repository view bound to the open
//! transaction; a nested `transaction` call on that view simply reuses it.

use async_trait::async_trait;
use sqlx::postgres::Postgres;
use sqlx::{PgPool, QueryBuilder, Transaction};
use tokio::sync::Mutex;

use crate::models::{
    NewTaskInstance, NewWorkflowInstance, QueryTaskInstanceParams, QueryWorkflowInstanceParams,
    TaskInstanceRow, UpdateTaskInstanceParams, UpdateWorkflowInstanceParams, WorkflowInstanceRow,
};
use crate::repo::{TxFn, WorkflowRepo};
use crate::{unix_now, DbError};

const INSTANCE_COLUMNS: &str =
    "id, workflow_type, business_id, status, workflow_context, task_id, created_at, updated_at";
const TASK_COLUMNS: &str =
    "id, workflow_instance_id, task_type, status, fail_count, node_context, created_at, updated_at";

/// Postgres-backed store.
pub struct PgRepo {
    pool: PgPool,
}

impl PgRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Repository view bound to an open transaction.
struct PgTxRepo {
    tx: Mutex<Transaction<'static, Postgres>>,
}

// ---------------------------------------------------------------------------
// Query assembly
// ---------------------------------------------------------------------------

/// Growing WHERE clause: emits ` WHERE ` for the first predicate and ` AND `
/// afterwards.
struct WherePrefix(bool);

impl WherePrefix {
    fn new() -> Self {
        Self(false)
    }
    fn push(&mut self, qb: &mut QueryBuilder<'_, Postgres>) {
        qb.push(if self.0 { " AND " } else { " WHERE " });
        self.0 = true;
    }
}

fn push_instance_filters(qb: &mut QueryBuilder<'_, Postgres>, p: &QueryWorkflowInstanceParams) {
    let mut w = WherePrefix::new();
    if let Some(id) = p.id {
        w.push(qb);
        qb.push("id = ").push_bind(id);
    }
    if !p.workflow_type_in.is_empty() {
        w.push(qb);
        qb.push("workflow_type = ANY(")
            .push_bind(p.workflow_type_in.clone())
            .push(")");
    }
    if let Some(business_id) = &p.business_id {
        w.push(qb);
        qb.push("business_id = ").push_bind(business_id.clone());
    }
    if !p.status_in.is_empty() {
        let statuses: Vec<String> = p.status_in.iter().map(|s| s.as_str().to_string()).collect();
        w.push(qb);
        qb.push("status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(floor) = p.id_greater_than {
        w.push(qb);
        qb.push("id > ").push_bind(floor);
    }
    if let Some(task_id) = p.task_id {
        w.push(qb);
        qb.push("task_id = ").push_bind(task_id);
    }
}

fn push_task_filters(qb: &mut QueryBuilder<'_, Postgres>, p: &QueryTaskInstanceParams) {
    let mut w = WherePrefix::new();
    if let Some(id) = p.id {
        w.push(qb);
        qb.push("id = ").push_bind(id);
    }
    if let Some(instance_id) = p.workflow_instance_id {
        w.push(qb);
        qb.push("workflow_instance_id = ").push_bind(instance_id);
    }
    if let Some(task_type) = &p.task_type {
        w.push(qb);
        qb.push("task_type = ").push_bind(task_type.clone());
    }
    if !p.status_in.is_empty() {
        let statuses: Vec<String> = p.status_in.iter().map(|s| s.as_str().to_string()).collect();
        w.push(qb);
        qb.push("status = ANY(").push_bind(statuses).push(")");
    }
    if let Some(floor) = p.id_greater_than {
        w.push(qb);
        qb.push("id > ").push_bind(floor);
    }
}

fn push_order_and_page(
    qb: &mut QueryBuilder<'_, Postgres>,
    order_by_id_asc: Option<bool>,
    page: &crate::models::Pager,
) {
    match order_by_id_asc {
        Some(true) => {
            qb.push(" ORDER BY id ASC");
        }
        Some(false) => {
            qb.push(" ORDER BY id DESC");
        }
        None => {}
    }
    if !page.is_no_limit {
        let (offset, limit) = page.window();
        qb.push(" LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
    }
}

// ---------------------------------------------------------------------------
// Shared operations, generic over pool / transaction executors
// ---------------------------------------------------------------------------

async fn create_instance<'e, E>(exec: E, row: NewWorkflowInstance) -> Result<WorkflowInstanceRow, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    let now = unix_now();
    let sql = format!(
        "INSERT INTO workflow_instance \
         (workflow_type, business_id, status, workflow_context, task_id, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {INSTANCE_COLUMNS}"
    );
    let row = sqlx::query_as::<_, WorkflowInstanceRow>(&sql)
        .bind(row.workflow_type)
        .bind(row.business_id)
        .bind(row.status.as_str())
        .bind(row.workflow_context)
        .bind(row.task_id)
        .bind(now)
        .bind(now)
        .fetch_one(exec)
        .await?;
    Ok(row)
}

async fn create_task<'e, E>(exec: E, row: NewTaskInstance) -> Result<TaskInstanceRow, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    let now = unix_now();
    let sql = format!(
        "INSERT INTO task_instance \
         (workflow_instance_id, task_type, status, fail_count, node_context, created_at, updated_at) \
         VALUES ($1, $2, $3, 0, $4, $5, $6) RETURNING {TASK_COLUMNS}"
    );
    let row = sqlx::query_as::<_, TaskInstanceRow>(&sql)
        .bind(row.workflow_instance_id)
        .bind(row.task_type)
        .bind(row.status.as_str())
        .bind(row.node_context)
        .bind(now)
        .bind(now)
        .fetch_one(exec)
        .await?;
    Ok(row)
}

async fn query_instances<'e, E>(
    exec: E,
    params: &QueryWorkflowInstanceParams,
) -> Result<Vec<WorkflowInstanceRow>, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instance"));
    push_instance_filters(&mut qb, params);
    push_order_and_page(&mut qb, params.order_by_id_asc, &params.page);
    let rows = qb
        .build_query_as::<WorkflowInstanceRow>()
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

async fn count_instances<'e, E>(
    exec: E,
    params: &QueryWorkflowInstanceParams,
) -> Result<i64, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM workflow_instance");
    push_instance_filters(&mut qb, params);
    let count = qb.build_query_scalar::<i64>().fetch_one(exec).await?;
    Ok(count)
}

async fn query_tasks<'e, E>(
    exec: E,
    params: &QueryTaskInstanceParams,
) -> Result<Vec<TaskInstanceRow>, DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM task_instance"));
    push_task_filters(&mut qb, params);
    push_order_and_page(&mut qb, params.order_by_id_asc, &params.page);
    let rows = qb
        .build_query_as::<TaskInstanceRow>()
        .fetch_all(exec)
        .await?;
    Ok(rows)
}

async fn update_instances<'e, E>(
    exec: E,
    params: UpdateWorkflowInstanceParams,
) -> Result<(), DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    params.validate()?;
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE workflow_instance SET ");
    let mut fields = qb.separated(", ");
    if let Some(status) = params.set_status {
        fields.push("status = ").push_bind_unseparated(status.as_str());
    }
    if let Some(ctx) = params.set_workflow_context {
        fields.push("workflow_context = ").push_bind_unseparated(ctx);
    }
    fields.push("updated_at = ").push_bind_unseparated(unix_now());

    // Predicates, optionally capped through an id-subquery.
    qb.push(" WHERE id IN (SELECT id FROM workflow_instance");
    let mut w = WherePrefix::new();
    if !params.id_in.is_empty() {
        w.push(&mut qb);
        qb.push("id = ANY(").push_bind(params.id_in.clone()).push(")");
    }
    if !params.status_in.is_empty() {
        let statuses: Vec<String> = params
            .status_in
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        w.push(&mut qb);
        qb.push("status = ANY(").push_bind(statuses).push(")");
    }
    qb.push(" ORDER BY id");
    if params.limit_max > 0 {
        qb.push(" LIMIT ").push_bind(params.limit_max as i64);
    }
    qb.push(")");

    qb.build().execute(exec).await?;
    Ok(())
}

async fn update_tasks<'e, E>(exec: E, params: UpdateTaskInstanceParams) -> Result<(), DbError>
where
    E: sqlx::PgExecutor<'e>,
{
    params.validate()?;
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("UPDATE task_instance SET ");
    let mut fields = qb.separated(", ");
    if let Some(status) = params.set_status {
        fields.push("status = ").push_bind_unseparated(status.as_str());
    }
    if let Some(ctx) = params.set_node_context {
        fields.push("node_context = ").push_bind_unseparated(ctx);
    }
    if let Some(fail_count) = params.set_fail_count {
        fields.push("fail_count = ").push_bind_unseparated(fail_count);
    }
    fields.push("updated_at = ").push_bind_unseparated(unix_now());

    qb.push(" WHERE id IN (SELECT id FROM task_instance WHERE id = ANY(")
        .push_bind(params.id_in.clone())
        .push(") ORDER BY id");
    if params.limit_max > 0 {
        qb.push(" LIMIT ").push_bind(params.limit_max as i64);
    }
    qb.push(")");

    qb.build().execute(exec).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkflowRepo for PgRepo {
    async fn create_workflow_instance(
        &self,
        row: NewWorkflowInstance,
    ) -> Result<WorkflowInstanceRow, DbError> {
        create_instance(&self.pool, row).await
    }

    async fn create_task_instance(
        &self,
        row: NewTaskInstance,
    ) -> Result<TaskInstanceRow, DbError> {
        create_task(&self.pool, row).await
    }

    async fn query_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<Vec<WorkflowInstanceRow>, DbError> {
        query_instances(&self.pool, params).await
    }

    async fn count_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<i64, DbError> {
        count_instances(&self.pool, params).await
    }

    async fn query_task_instance(
        &self,
        params: &QueryTaskInstanceParams,
    ) -> Result<Vec<TaskInstanceRow>, DbError> {
        query_tasks(&self.pool, params).await
    }

    async fn update_workflow_instance(
        &self,
        params: UpdateWorkflowInstanceParams,
    ) -> Result<(), DbError> {
        update_instances(&self.pool, params).await
    }

    async fn update_task_instance(
        &self,
        params: UpdateTaskInstanceParams,
    ) -> Result<(), DbError> {
        update_tasks(&self.pool, params).await
    }

    async fn transaction<'a>(&'a self, f: TxFn<'a>) -> Result<(), DbError> {
        let tx = self.pool.begin().await?;
        let tx_repo = PgTxRepo { tx: Mutex::new(tx) };
        match f(&tx_repo).await {
            Ok(()) => {
                tx_repo.tx.into_inner().commit().await?;
                Ok(())
            }
            Err(e) => {
                if let Err(rollback_err) = tx_repo.tx.into_inner().rollback().await {
                    tracing::error!(error = %rollback_err, "transaction rollback failed");
                }
                Err(DbError::Tx(e))
            }
        }
    }
}

#[async_trait]
impl WorkflowRepo for PgTxRepo {
    async fn create_workflow_instance(
        &self,
        row: NewWorkflowInstance,
    ) -> Result<WorkflowInstanceRow, DbError> {
        let mut tx = self.tx.lock().await;
        create_instance(&mut **tx, row).await
    }

    async fn create_task_instance(
        &self,
        row: NewTaskInstance,
    ) -> Result<TaskInstanceRow, DbError> {
        let mut tx = self.tx.lock().await;
        create_task(&mut **tx, row).await
    }

    async fn query_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<Vec<WorkflowInstanceRow>, DbError> {
        let mut tx = self.tx.lock().await;
        query_instances(&mut **tx, params).await
    }

    async fn count_workflow_instance(
        &self,
        params: &QueryWorkflowInstanceParams,
    ) -> Result<i64, DbError> {
        let mut tx = self.tx.lock().await;
        count_instances(&mut **tx, params).await
    }

    async fn query_task_instance(
        &self,
        params: &QueryTaskInstanceParams,
    ) -> Result<Vec<TaskInstanceRow>, DbError> {
        let mut tx = self.tx.lock().await;
        query_tasks(&mut **tx, params).await
    }

    async fn update_workflow_instance(
        &self,
        params: UpdateWorkflowInstanceParams,
    ) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        update_instances(&mut **tx, params).await
    }

    async fn update_task_instance(
        &self,
        params: UpdateTaskInstanceParams,
    ) -> Result<(), DbError> {
        let mut tx = self.tx.lock().await;
        update_tasks(&mut **tx, params).await
    }

    /// Nested scope: reuse the outer transaction.
    async fn transaction<'a>(&'a self, f: TxFn<'a>) -> Result<(), DbError> {
        f(self).await.map_err(DbError::Tx)
    }
}
