//! Recovery engine: reclaims PENDING workflows on startup, by executor id

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::config::VMID_ENV_VAR;
use crate::error::SysDbError;
use crate::executor::WorkflowExecutor;
use crate::sysdb::{SystemDatabase, WorkflowStatusRow};

/// List the PENDING workflows owned by `executor_id`, skipping entirely if
/// this is the `"local"` executor running under a managed VM (the platform
/// handles recovery externally in that case).
#[instrument(skip(db))]
pub async fn list_pending_workflows(
    db: &SystemDatabase,
    executor_id: &str,
) -> Result<Vec<String>, SysDbError> {
    if executor_id == "local" && std::env::var(VMID_ENV_VAR).is_ok() {
        info!("skipping local recovery: managed VM detected");
        return Ok(Vec::new());
    }
    db.get_pending_workflows(executor_id).await
}

/// Re-execute each pending workflow, flagging the attempt as a recovery so
/// `recovery_attempts` increments. This is the synchronous, one-shot
/// counterpart to `spawn_recovery_loop`.
#[instrument(skip(db, executor))]
pub async fn recover_pending_workflows(
    db: &SystemDatabase,
    executor: &dyn WorkflowExecutor,
    executor_id: &str,
) -> Result<(), SysDbError> {
    let pending = list_pending_workflows(db, executor_id).await?;
    for workflow_uuid in pending {
        mark_in_recovery(db, &workflow_uuid).await?;
        executor.execute_by_id(&workflow_uuid).await?;
    }
    Ok(())
}

async fn mark_in_recovery(db: &SystemDatabase, workflow_uuid: &str) -> Result<(), SysDbError> {
    let existing = db
        .get_workflow_status(workflow_uuid)
        .await?
        .unwrap_or_else(|| WorkflowStatusRow {
            workflow_uuid: workflow_uuid.to_string(),
            status: crate::sysdb::WorkflowStatusValue::Pending,
            name: String::new(),
            class_name: None,
            config_name: None,
            output: None,
            error: None,
            executor_id: None,
            application_version: None,
            application_id: None,
            request: None,
            recovery_attempts: 0,
            authenticated_user: None,
            authenticated_roles: None,
            assumed_role: None,
            queue_name: None,
            created_at: 0,
        });
    db.update_workflow_status(&existing, false, true).await
}

/// Background recovery thread, run once on startup. Retries the pending
/// list element-by-element, catching `WorkflowFunctionNotFound` (the code
/// hasn't registered yet) and sleeping 1s before retrying that element.
/// Any other error is fatal and propagates. Terminates once the list
/// drains or `shutdown` fires.
pub fn spawn_recovery_loop(
    db: SystemDatabase,
    executor: Arc<dyn WorkflowExecutor>,
    executor_ids: Vec<String>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<Result<(), SysDbError>> {
    tokio::spawn(async move {
        for executor_id in executor_ids {
            let mut pending = list_pending_workflows(&db, &executor_id).await?;
            while let Some(workflow_uuid) = pending.first().cloned() {
                if *shutdown.borrow() {
                    return Ok(());
                }

                mark_in_recovery(&db, &workflow_uuid).await?;
                match executor.execute_by_id(&workflow_uuid).await {
                    Ok(_) => {
                        pending.remove(0);
                    }
                    Err(SysDbError::WorkflowFunctionNotFound(name)) => {
                        warn!(%name, "workflow function not yet registered, retrying");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    return Ok(());
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "fatal error during startup recovery");
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    })
}
