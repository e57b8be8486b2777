//! Operation output journal — the OAOO primitive every durable step rests on

use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;

use super::SystemDatabase;
use crate::error::SysDbError;

/// A journaled step result. Exactly one of `output`/`error` is set.
#[derive(Debug, Clone)]
pub struct OperationResult {
    pub workflow_uuid: String,
    pub function_id: i64,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl SystemDatabase {
    /// `record_operation_result`: insert the step's result. Unique-violation
    /// on `(workflow_uuid, function_id)` maps to `WorkflowConflict`.
    #[instrument(skip(self, result), fields(workflow_uuid = %result.workflow_uuid, function_id = result.function_id))]
    pub async fn record_operation_result(
        &self,
        result: &OperationResult,
    ) -> Result<(), SysDbError> {
        debug_assert!(
            result.output.is_none() != result.error.is_none()
                || (result.output.is_none() && result.error.is_none()),
            "at most one of output/error should be set"
        );

        sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, error)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&result.workflow_uuid)
        .bind(result.function_id)
        .bind(&result.output)
        .bind(&result.error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            SysDbError::from_insert_error(
                e,
                uuid::Uuid::parse_str(&result.workflow_uuid).unwrap_or_else(|_| uuid::Uuid::nil()),
            )
        })?;

        Ok(())
    }

    /// `check_operation_execution`: the OAOO read path used by the executor
    /// before running a step, and again on replay.
    #[instrument(skip(self))]
    pub async fn check_operation_execution(
        &self,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<OperationResult>, SysDbError> {
        let row = sqlx::query(
            r#"SELECT output, error FROM dbos.operation_outputs
               WHERE workflow_uuid = $1 AND function_id = $2"#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| OperationResult {
            workflow_uuid: workflow_uuid.to_string(),
            function_id,
            output: r.get("output"),
            error: r.get("error"),
        }))
    }

    /// Transaction-scoped variant of `check_operation_execution`, for callers
    /// that must read the OAOO journal as part of a larger single-transaction
    /// operation (e.g. `send`).
    pub(crate) async fn check_operation_execution_tx(
        tx: &mut Transaction<'_, Postgres>,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<OperationResult>, SysDbError> {
        let row = sqlx::query(
            r#"SELECT output, error FROM dbos.operation_outputs
               WHERE workflow_uuid = $1 AND function_id = $2"#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|r| OperationResult {
            workflow_uuid: workflow_uuid.to_string(),
            function_id,
            output: r.get("output"),
            error: r.get("error"),
        }))
    }

    /// Transaction-scoped variant of `record_operation_result`.
    pub(crate) async fn record_operation_result_tx(
        tx: &mut Transaction<'_, Postgres>,
        result: &OperationResult,
    ) -> Result<(), SysDbError> {
        sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, error)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&result.workflow_uuid)
        .bind(result.function_id)
        .bind(&result.output)
        .bind(&result.error)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            SysDbError::from_insert_error(
                e,
                uuid::Uuid::parse_str(&result.workflow_uuid).unwrap_or_else(|_| uuid::Uuid::nil()),
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_shape_holds_at_most_one_field() {
        let r = OperationResult {
            workflow_uuid: "w".into(),
            function_id: 1,
            output: Some("\"a\"".into()),
            error: None,
        };
        assert!(r.output.is_some() && r.error.is_none());
    }
}
