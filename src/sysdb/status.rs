//! Workflow status: creation, updates, and read-side projections

use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::{Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::SystemDatabase;
use crate::error::SysDbError;
use crate::serializer;

/// The set of statuses a workflow can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WorkflowStatusValue {
    Pending,
    Success,
    Error,
    RetriesExceeded,
    Cancelled,
    Enqueued,
}

impl WorkflowStatusValue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::RetriesExceeded => "RETRIES_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::Enqueued => "ENQUEUED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "RETRIES_EXCEEDED" => Some(Self::RetriesExceeded),
            "CANCELLED" => Some(Self::Cancelled),
            "ENQUEUED" => Some(Self::Enqueued),
            _ => None,
        }
    }
}

/// A full `workflow_status` row, as journaled or read back.
#[derive(Debug, Clone)]
pub struct WorkflowStatusRow {
    pub workflow_uuid: String,
    pub status: WorkflowStatusValue,
    pub name: String,
    pub class_name: Option<String>,
    pub config_name: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub executor_id: Option<String>,
    pub application_version: Option<String>,
    pub application_id: Option<String>,
    pub request: Option<String>,
    pub recovery_attempts: i64,
    pub authenticated_user: Option<String>,
    pub authenticated_roles: Option<String>,
    pub assumed_role: Option<String>,
    pub queue_name: Option<String>,
    pub created_at: i64,
}

impl WorkflowStatusRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, SysDbError> {
        let status_text: String = row.get("status");
        Ok(Self {
            workflow_uuid: row.get("workflow_uuid"),
            status: WorkflowStatusValue::parse(&status_text)
                .unwrap_or(WorkflowStatusValue::Pending),
            name: row.get("name"),
            class_name: row.get("class_name"),
            config_name: row.get("config_name"),
            output: row.get("output"),
            error: row.get("error"),
            executor_id: row.get("executor_id"),
            application_version: row.get("application_version"),
            application_id: row.get("application_id"),
            request: row.get("request"),
            recovery_attempts: row.get("recovery_attempts"),
            authenticated_user: row.get("authenticated_user"),
            authenticated_roles: row.get("authenticated_roles"),
            assumed_role: row.get("assumed_role"),
            queue_name: row.get("queue_name"),
            created_at: row.get("created_at"),
        })
    }
}

/// Filter for the read-only `get_workflows` projection.
#[derive(Debug, Clone, Default)]
pub struct GetWorkflowsFilter {
    pub name: Option<String>,
    pub authenticated_user: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub status: Option<WorkflowStatusValue>,
    pub application_version: Option<String>,
    pub limit: Option<i64>,
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

impl SystemDatabase {
    /// `update_workflow_status(status, replace, in_recovery)`.
    ///
    /// `replace=true`: upsert updating status/output/error.
    /// `in_recovery=true`: upsert that bumps `recovery_attempts` on conflict.
    /// Otherwise: insert-or-ignore, preserving an existing authoritative row.
    #[instrument(skip(self, row), fields(workflow_uuid = %row.workflow_uuid))]
    pub async fn update_workflow_status(
        &self,
        row: &WorkflowStatusRow,
        replace: bool,
        in_recovery: bool,
    ) -> Result<(), SysDbError> {
        if in_recovery {
            sqlx::query(
                r#"
                INSERT INTO dbos.workflow_status
                    (workflow_uuid, status, name, class_name, config_name, executor_id,
                     application_version, application_id, request, authenticated_user,
                     authenticated_roles, assumed_role, queue_name)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (workflow_uuid) DO UPDATE SET
                    recovery_attempts = dbos.workflow_status.recovery_attempts + 1
                "#,
            )
            .bind(&row.workflow_uuid)
            .bind(row.status.as_str())
            .bind(&row.name)
            .bind(&row.class_name)
            .bind(&row.config_name)
            .bind(&row.executor_id)
            .bind(&row.application_version)
            .bind(&row.application_id)
            .bind(&row.request)
            .bind(&row.authenticated_user)
            .bind(&row.authenticated_roles)
            .bind(&row.assumed_role)
            .bind(&row.queue_name)
            .execute(&self.pool)
            .await?;
        } else if replace {
            sqlx::query(
                r#"
                INSERT INTO dbos.workflow_status
                    (workflow_uuid, status, name, class_name, config_name, output, error,
                     executor_id, application_version, application_id, request,
                     authenticated_user, authenticated_roles, assumed_role, queue_name)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (workflow_uuid) DO UPDATE SET
                    status = EXCLUDED.status,
                    output = EXCLUDED.output,
                    error = EXCLUDED.error,
                    updated_at = (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT
                "#,
            )
            .bind(&row.workflow_uuid)
            .bind(row.status.as_str())
            .bind(&row.name)
            .bind(&row.class_name)
            .bind(&row.config_name)
            .bind(&row.output)
            .bind(&row.error)
            .bind(&row.executor_id)
            .bind(&row.application_version)
            .bind(&row.application_id)
            .bind(&row.request)
            .bind(&row.authenticated_user)
            .bind(&row.authenticated_roles)
            .bind(&row.assumed_role)
            .bind(&row.queue_name)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO dbos.workflow_status
                    (workflow_uuid, status, name, class_name, config_name, executor_id,
                     application_version, application_id, request, authenticated_user,
                     authenticated_roles, assumed_role, queue_name)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (workflow_uuid) DO NOTHING
                "#,
            )
            .bind(&row.workflow_uuid)
            .bind(row.status.as_str())
            .bind(&row.name)
            .bind(&row.class_name)
            .bind(&row.config_name)
            .bind(&row.executor_id)
            .bind(&row.application_version)
            .bind(&row.application_id)
            .bind(&row.request)
            .bind(&row.authenticated_user)
            .bind(&row.authenticated_roles)
            .bind(&row.assumed_role)
            .bind(&row.queue_name)
            .execute(&self.pool)
            .await?;
        }

        if self
            .inner
            .temp_txn_wf_ids
            .lock()
            .contains(&row.workflow_uuid)
        {
            self.inner
                .exported_temp_txn_wf_status
                .lock()
                .insert(row.workflow_uuid.clone());
        }

        debug!(status = row.status.as_str(), "updated workflow status");
        Ok(())
    }

    /// Transaction-scoped variant of `update_workflow_status`, for callers
    /// that must apply several rows atomically in one batch (the buffered
    /// writer's status flush).
    pub(crate) async fn update_workflow_status_tx(
        tx: &mut Transaction<'_, Postgres>,
        row: &WorkflowStatusRow,
        replace: bool,
        in_recovery: bool,
    ) -> Result<(), SysDbError> {
        if in_recovery {
            sqlx::query(
                r#"
                INSERT INTO dbos.workflow_status
                    (workflow_uuid, status, name, class_name, config_name, executor_id,
                     application_version, application_id, request, authenticated_user,
                     authenticated_roles, assumed_role, queue_name)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (workflow_uuid) DO UPDATE SET
                    recovery_attempts = dbos.workflow_status.recovery_attempts + 1
                "#,
            )
            .bind(&row.workflow_uuid)
            .bind(row.status.as_str())
            .bind(&row.name)
            .bind(&row.class_name)
            .bind(&row.config_name)
            .bind(&row.executor_id)
            .bind(&row.application_version)
            .bind(&row.application_id)
            .bind(&row.request)
            .bind(&row.authenticated_user)
            .bind(&row.authenticated_roles)
            .bind(&row.assumed_role)
            .bind(&row.queue_name)
            .execute(&mut **tx)
            .await?;
        } else if replace {
            sqlx::query(
                r#"
                INSERT INTO dbos.workflow_status
                    (workflow_uuid, status, name, class_name, config_name, output, error,
                     executor_id, application_version, application_id, request,
                     authenticated_user, authenticated_roles, assumed_role, queue_name)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (workflow_uuid) DO UPDATE SET
                    status = EXCLUDED.status,
                    output = EXCLUDED.output,
                    error = EXCLUDED.error,
                    updated_at = (EXTRACT(EPOCH FROM now()) * 1000)::BIGINT
                "#,
            )
            .bind(&row.workflow_uuid)
            .bind(row.status.as_str())
            .bind(&row.name)
            .bind(&row.class_name)
            .bind(&row.config_name)
            .bind(&row.output)
            .bind(&row.error)
            .bind(&row.executor_id)
            .bind(&row.application_version)
            .bind(&row.application_id)
            .bind(&row.request)
            .bind(&row.authenticated_user)
            .bind(&row.authenticated_roles)
            .bind(&row.assumed_role)
            .bind(&row.queue_name)
            .execute(&mut **tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                INSERT INTO dbos.workflow_status
                    (workflow_uuid, status, name, class_name, config_name, executor_id,
                     application_version, application_id, request, authenticated_user,
                     authenticated_roles, assumed_role, queue_name)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (workflow_uuid) DO NOTHING
                "#,
            )
            .bind(&row.workflow_uuid)
            .bind(row.status.as_str())
            .bind(&row.name)
            .bind(&row.class_name)
            .bind(&row.config_name)
            .bind(&row.executor_id)
            .bind(&row.application_version)
            .bind(&row.application_id)
            .bind(&row.request)
            .bind(&row.authenticated_user)
            .bind(&row.authenticated_roles)
            .bind(&row.assumed_role)
            .bind(&row.queue_name)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// `set_workflow_status(uuid, status, reset_recovery_attempts)`. UPDATE
    /// only; silent no-op if the row doesn't exist yet.
    #[instrument(skip(self))]
    pub async fn set_workflow_status(
        &self,
        workflow_uuid: &str,
        status: WorkflowStatusValue,
        reset_recovery_attempts: Option<i32>,
    ) -> Result<(), SysDbError> {
        match reset_recovery_attempts {
            Some(value) => {
                sqlx::query(
                    r#"UPDATE dbos.workflow_status SET status = $1, recovery_attempts = $2
                       WHERE workflow_uuid = $3"#,
                )
                .bind(status.as_str())
                .bind(value as i64)
                .bind(workflow_uuid)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(r#"UPDATE dbos.workflow_status SET status = $1 WHERE workflow_uuid = $2"#)
                    .bind(status.as_str())
                    .bind(workflow_uuid)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_workflow_status(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError> {
        let row = sqlx::query(r#"SELECT * FROM dbos.workflow_status WHERE workflow_uuid = $1"#)
            .bind(workflow_uuid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(WorkflowStatusRow::from_row).transpose()
    }

    /// Same as `get_workflow_status` but also returns the recorded
    /// output/error inline (they're already columns on the row; kept as a
    /// distinct name to match the read-path vocabulary used elsewhere).
    #[instrument(skip(self))]
    pub async fn get_workflow_status_w_outputs(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError> {
        self.get_workflow_status(workflow_uuid).await
    }

    #[instrument(skip(self))]
    pub async fn get_workflow_info(
        &self,
        workflow_uuid: &str,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError> {
        self.get_workflow_status(workflow_uuid).await
    }

    /// OAOO-wrapped status read: on first call, reads the status and
    /// journals it as an operation output under `(caller_wf, caller_fn)`;
    /// on replay, returns the journaled snapshot instead of re-reading.
    #[instrument(skip(self))]
    pub async fn get_workflow_status_within_wf(
        &self,
        target_uuid: &str,
        caller_wf: &str,
        caller_fn: i64,
    ) -> Result<Option<WorkflowStatusRow>, SysDbError> {
        if let Some(recorded) = self.check_operation_execution(caller_wf, caller_fn).await? {
            return match recorded.output {
                Some(text) => {
                    let value: Option<SerializedStatus> = serializer::deserialize(&text)?;
                    Ok(value.map(Into::into))
                }
                None => Ok(None),
            };
        }

        let status = self.get_workflow_status(target_uuid).await?;
        let serialized = serializer::serialize(&status.clone().map(SerializedStatus::from))?;
        self.record_operation_result(&super::operations::OperationResult {
            workflow_uuid: caller_wf.to_string(),
            function_id: caller_fn,
            output: Some(serialized),
            error: None,
        })
        .await?;
        Ok(status)
    }

    /// Polls `workflow_status` every 1s until SUCCESS (returns the
    /// deserialized output) or ERROR (returns the deserialized error). An
    /// absent row is "not yet observed" and keeps polling. No timeout.
    #[instrument(skip(self))]
    pub async fn await_workflow_result(
        &self,
        workflow_uuid: &str,
    ) -> Result<Result<Option<String>, Option<String>>, SysDbError> {
        loop {
            if let Some(row) = self.get_workflow_status(workflow_uuid).await? {
                match row.status {
                    WorkflowStatusValue::Success => return Ok(Ok(row.output)),
                    WorkflowStatusValue::Error => return Ok(Err(row.error)),
                    _ => {}
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    /// `get_pending_workflows(executor_id)`: all PENDING workflow UUIDs
    /// owned by the given executor.
    #[instrument(skip(self))]
    pub async fn get_pending_workflows(
        &self,
        executor_id: &str,
    ) -> Result<Vec<String>, SysDbError> {
        let rows = sqlx::query(
            r#"SELECT workflow_uuid FROM dbos.workflow_status
               WHERE executor_id = $1 AND status = 'PENDING'"#,
        )
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("workflow_uuid")).collect())
    }

    /// Read-only filtered projection over `workflow_status`.
    #[instrument(skip(self, filter))]
    pub async fn get_workflows(
        &self,
        filter: &GetWorkflowsFilter,
    ) -> Result<Vec<WorkflowStatusRow>, SysDbError> {
        let mut query = String::from("SELECT * FROM dbos.workflow_status WHERE TRUE");
        let mut binds: Vec<String> = Vec::new();

        if let Some(name) = &filter.name {
            query.push_str(&format!(" AND name = ${}", binds.len() + 1));
            binds.push(name.clone());
        }
        if let Some(user) = &filter.authenticated_user {
            query.push_str(&format!(" AND authenticated_user = ${}", binds.len() + 1));
            binds.push(user.clone());
        }
        if let Some(version) = &filter.application_version {
            query.push_str(&format!(" AND application_version = ${}", binds.len() + 1));
            binds.push(version.clone());
        }
        if let Some(status) = &filter.status {
            query.push_str(&format!(" AND status = ${}", binds.len() + 1));
            binds.push(status.as_str().to_string());
        }

        let mut int_binds: Vec<i64> = Vec::new();
        if let Some(start) = filter.start_time {
            query.push_str(&format!(" AND created_at >= ${}", binds.len() + int_binds.len() + 1));
            int_binds.push(start);
        }
        if let Some(end) = filter.end_time {
            query.push_str(&format!(" AND created_at <= ${}", binds.len() + int_binds.len() + 1));
            int_binds.push(end);
        }

        query.push_str(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }

        let mut q = sqlx::query(&query);
        for bind in &binds {
            q = q.bind(bind);
        }
        for value in &int_binds {
            q = q.bind(value);
        }
        let rows: Vec<WorkflowStatusRow> = q
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(WorkflowStatusRow::from_row)
            .collect::<Result<_, _>>()?;

        Ok(rows)
    }
}

/// Compact JSON-serializable mirror of `WorkflowStatusRow`, used as the
/// payload journaled by `get_workflow_status_within_wf`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct SerializedStatus {
    workflow_uuid: String,
    status: String,
    name: String,
    output: Option<String>,
    error: Option<String>,
    recovery_attempts: i64,
    created_at: i64,
}

impl From<WorkflowStatusRow> for SerializedStatus {
    fn from(row: WorkflowStatusRow) -> Self {
        Self {
            workflow_uuid: row.workflow_uuid,
            status: row.status.as_str().to_string(),
            name: row.name,
            output: row.output,
            error: row.error,
            recovery_attempts: row.recovery_attempts,
            created_at: row.created_at,
        }
    }
}

impl From<SerializedStatus> for WorkflowStatusRow {
    fn from(s: SerializedStatus) -> Self {
        Self {
            workflow_uuid: s.workflow_uuid,
            status: WorkflowStatusValue::parse(&s.status).unwrap_or(WorkflowStatusValue::Pending),
            name: s.name,
            class_name: None,
            config_name: None,
            output: s.output,
            error: s.error,
            executor_id: None,
            application_version: None,
            application_id: None,
            request: None,
            recovery_attempts: s.recovery_attempts,
            authenticated_user: None,
            authenticated_roles: None,
            assumed_role: None,
            queue_name: None,
            created_at: s.created_at,
        }
    }
}

/// Generate a fresh workflow UUID. Exposed here since status creation is
/// the natural point a new workflow identity is minted.
pub fn new_workflow_uuid() -> String {
    Uuid::new_v4().to_string()
}
