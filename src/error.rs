//! Error taxonomy shared by the application and system database journals

use uuid::Uuid;

/// Errors raised by the durable journal and coordination layer
#[derive(Debug, thiserror::Error)]
pub enum SysDbError {
    /// Unique-violation (SQLSTATE 23505) on an OAOO journal insert.
    ///
    /// Signals that the same (workflow, function_id) tuple, the same
    /// workflow status row, or the same transaction output was written
    /// concurrently. Usually swallowed by the caller's idempotent retry
    /// logic; surfaced when the caller needs to react to the conflict.
    #[error("workflow conflict: {0} already has a recorded result for this step")]
    WorkflowConflict(Uuid),

    /// Foreign-key violation (SQLSTATE 23503) on a `notifications` insert.
    #[error("workflow does not exist: {0}")]
    NonExistentWorkflow(Uuid),

    /// The workflow code named by a pending row has not been registered yet.
    ///
    /// Caught by the startup recovery loop, which retries after a 1s sleep.
    #[error("workflow function not registered: {0}")]
    WorkflowFunctionNotFound(String),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failure to serialize or deserialize a journaled value.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SysDbError {
    /// Map a `sqlx::Error` to the named conflict kinds this crate cares
    /// about, falling back to `Database` for anything else.
    pub(crate) fn from_insert_error(err: sqlx::Error, conflict_id: Uuid) -> Self {
        if let Some(db_err) = err.as_database_error() {
            match db_err.code().as_deref() {
                Some("23505") => return SysDbError::WorkflowConflict(conflict_id),
                Some("23503") => return SysDbError::NonExistentWorkflow(conflict_id),
                _ => {}
            }
        }
        SysDbError::Database(err)
    }
}
