//! Application database adjunct — the transactional step journal
//!
//! `transaction_outputs` lives in the *application* database so that a
//! step's OAOO record commits atomically with whatever SQL the step ran.
//! Every write here must run on the caller's own transaction/connection;
//! this module never opens its own transaction for the success path.

use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument};

use crate::error::SysDbError;
use crate::schema;

/// The OAOO result of a transactional step, ready to journal.
///
/// `txn_id` is not part of this struct: it is the Postgres transaction id
/// assigned to the committing transaction, which only the server can supply
/// (`pg_current_xact_id_if_assigned()`), so it is computed inline in the
/// INSERT rather than threaded through by the caller.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub workflow_uuid: String,
    pub function_id: i64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub txn_snapshot: String,
    pub executor_id: Option<String>,
}

/// Wraps the application's own `PgPool` with the `dbos.transaction_outputs`
/// journal. The rest of the application database is the user's.
#[derive(Clone)]
pub struct AppDatabase {
    pool: PgPool,
}

impl AppDatabase {
    /// Connect and ensure the `dbos` schema / journal table exist.
    pub async fn connect(database_url: &str) -> Result<Self, SysDbError> {
        let pool = PgPool::connect(database_url).await?;
        schema::migrate_appdb(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Record a transactional step's result on the caller's own transaction,
    /// so it commits atomically with the step's user SQL.
    #[instrument(skip(self, tx, result), fields(workflow_uuid = %result.workflow_uuid, function_id = result.function_id))]
    pub async fn record_transaction_output(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        result: &TransactionResult,
    ) -> Result<(), SysDbError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dbos.transaction_outputs
                (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, executor_id)
            VALUES ($1, $2, $3, $4, (select pg_current_xact_id_if_assigned()::text), $5, $6)
            "#,
        )
        .bind(&result.workflow_uuid)
        .bind(result.function_id)
        .bind(&result.output)
        .bind(&result.error)
        .bind(&result.txn_snapshot)
        .bind(&result.executor_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            SysDbError::from_insert_error(e, uuid_from_str(&result.workflow_uuid))
        })?;

        debug!(rows = inserted.rows_affected(), "recorded transaction output");
        Ok(())
    }

    /// Record a transactional step's failure. Unlike the success path there
    /// is no user SQL to co-commit with, so this opens its own transaction.
    #[instrument(skip(self, result), fields(workflow_uuid = %result.workflow_uuid, function_id = result.function_id))]
    pub async fn record_transaction_error(
        &self,
        result: &TransactionResult,
    ) -> Result<(), SysDbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO dbos.transaction_outputs
                (workflow_uuid, function_id, output, error, txn_id, txn_snapshot, executor_id)
            VALUES ($1, $2, NULL, $3, NULL, $4, $5)
            "#,
        )
        .bind(&result.workflow_uuid)
        .bind(result.function_id)
        .bind(&result.error)
        .bind(&result.txn_snapshot)
        .bind(&result.executor_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| SysDbError::from_insert_error(e, uuid_from_str(&result.workflow_uuid)))?;
        tx.commit().await?;
        Ok(())
    }

    /// The OAOO read path: has this step already run?
    #[instrument(skip(self))]
    pub async fn check_transaction_execution(
        &self,
        workflow_uuid: &str,
        function_id: i64,
    ) -> Result<Option<(Option<String>, Option<String>)>, SysDbError> {
        let row = sqlx::query_as::<_, (Option<String>, Option<String>)>(
            r#"
            SELECT output, error FROM dbos.transaction_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_uuid)
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

fn uuid_from_str(s: &str) -> uuid::Uuid {
    uuid::Uuid::parse_str(s).unwrap_or_else(|_| uuid::Uuid::nil())
}
