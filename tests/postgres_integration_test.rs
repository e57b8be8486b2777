//! Integration tests for the system database
//!
//! Run with: DATABASE_URL=postgres://... cargo test --test postgres_integration_test -- --test-threads=1
//!
//! Skipped (with a log line) if DATABASE_URL is unset.

use durable_sysdb::sysdb::{
    new_workflow_uuid, OperationResult, QueueRateLimit, QueueSpec, SystemDatabase,
    WorkflowStatusRow, WorkflowStatusValue,
};

fn get_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

async fn connect() -> Option<SystemDatabase> {
    match get_database_url() {
        Some(url) => Some(SystemDatabase::connect(&url).await.expect("connect to sysdb")),
        None => {
            eprintln!("DATABASE_URL not set, skipping postgres integration test");
            None
        }
    }
}

fn new_status_row(workflow_uuid: &str, name: &str) -> WorkflowStatusRow {
    WorkflowStatusRow {
        workflow_uuid: workflow_uuid.to_string(),
        status: WorkflowStatusValue::Pending,
        name: name.to_string(),
        class_name: None,
        config_name: None,
        output: None,
        error: None,
        executor_id: Some("local".to_string()),
        application_version: None,
        application_id: None,
        request: None,
        recovery_attempts: 0,
        authenticated_user: None,
        authenticated_roles: None,
        assumed_role: None,
        queue_name: None,
        created_at: 0,
    }
}

async fn cleanup_workflow(db: &SystemDatabase, workflow_uuid: &str) {
    sqlx::query("DELETE FROM dbos.notifications WHERE destination_uuid = $1")
        .bind(workflow_uuid)
        .execute(db.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM dbos.workflow_events WHERE workflow_uuid = $1")
        .bind(workflow_uuid)
        .execute(db.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM dbos.job_queue WHERE workflow_uuid = $1")
        .bind(workflow_uuid)
        .execute(db.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM dbos.operation_outputs WHERE workflow_uuid = $1")
        .bind(workflow_uuid)
        .execute(db.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
        .bind(workflow_uuid)
        .execute(db.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM dbos.workflow_status WHERE workflow_uuid = $1")
        .bind(workflow_uuid)
        .execute(db.pool())
        .await
        .ok();
}

/// S1 — OAOO step
#[tokio::test]
async fn s1_oaoo_step_conflicts_on_rewrite() {
    let Some(db) = connect().await else { return };
    let w = new_workflow_uuid();
    db.update_workflow_status(&new_status_row(&w, "s1"), false, false)
        .await
        .unwrap();

    db.record_operation_result(&OperationResult {
        workflow_uuid: w.clone(),
        function_id: 3,
        output: Some("\"a\"".to_string()),
        error: None,
    })
    .await
    .unwrap();

    let err = db
        .record_operation_result(&OperationResult {
            workflow_uuid: w.clone(),
            function_id: 3,
            output: Some("\"b\"".to_string()),
            error: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, durable_sysdb::error::SysDbError::WorkflowConflict(_)));

    let recorded = db.check_operation_execution(&w, 3).await.unwrap().unwrap();
    assert_eq!(recorded.output.as_deref(), Some("\"a\""));

    cleanup_workflow(&db, &w).await;
}

/// S2 — send/recv
#[tokio::test]
async fn s2_send_recv_fifo_and_missing_destination() {
    let Some(db) = connect().await else { return };

    let ghost = new_workflow_uuid();
    let err = db
        .send(&ghost, 0, &ghost, "42", Some("t"))
        .await
        .unwrap_err();
    assert!(matches!(err, durable_sysdb::error::SysDbError::NonExistentWorkflow(_)));

    let w = new_workflow_uuid();
    db.update_workflow_status(&new_status_row(&w, "s2"), false, false)
        .await
        .unwrap();

    db.send(&w, 100, &w, "42", Some("t")).await.unwrap();
    db.send(&w, 101, &w, "43", Some("t")).await.unwrap();

    let first = db.recv(&w, 1, Some("t"), 900, 1.0).await.unwrap();
    assert_eq!(first.as_deref(), Some("42"));
    let second = db.recv(&w, 2, Some("t"), 901, 1.0).await.unwrap();
    assert_eq!(second.as_deref(), Some("43"));
    let third = db.recv(&w, 3, Some("t"), 902, 1.0).await.unwrap();
    assert_eq!(third, None);

    cleanup_workflow(&db, &w).await;
}

/// S4 — queue concurrency
#[tokio::test]
async fn s4_queue_admits_up_to_concurrency_then_drains() {
    let Some(db) = connect().await else { return };

    let queue = QueueSpec {
        name: format!("q-{}", new_workflow_uuid()),
        concurrency: Some(2),
        limiter: None,
    };

    let mut workflows = Vec::new();
    for i in 0..5 {
        let w = new_workflow_uuid();
        db.update_workflow_status(&new_status_row(&w, &format!("s4-{i}")), false, false)
            .await
            .unwrap();
        db.enqueue(&w, &queue.name).await.unwrap();
        workflows.push(w);
    }

    let admitted = db.start_queued_workflows(&queue).await.unwrap();
    assert_eq!(admitted.len(), 2);
    assert_eq!(&admitted, &workflows[0..2]);

    let second_tick = db.start_queued_workflows(&queue).await.unwrap();
    assert!(second_tick.is_empty());

    db.set_workflow_status(&workflows[0], WorkflowStatusValue::Success, None)
        .await
        .unwrap();
    db.remove_from_queue(&workflows[0]).await.unwrap();

    let third_tick = db.start_queued_workflows(&queue).await.unwrap();
    assert_eq!(third_tick, vec![workflows[2].clone()]);

    for w in &workflows {
        cleanup_workflow(&db, w).await;
    }
}

/// Rate limiter (Open Question resolution): admits no more than `limit`
/// starts per rolling window, even with room under `concurrency`.
#[tokio::test]
async fn queue_rate_limit_caps_admissions_per_window() {
    let Some(db) = connect().await else { return };

    let queue = QueueSpec {
        name: format!("q-rl-{}", new_workflow_uuid()),
        concurrency: Some(10),
        limiter: Some(QueueRateLimit {
            limit: 1,
            period_secs: 60.0,
        }),
    };

    let w1 = new_workflow_uuid();
    let w2 = new_workflow_uuid();
    for (i, w) in [&w1, &w2].into_iter().enumerate() {
        db.update_workflow_status(&new_status_row(w, &format!("rl-{i}")), false, false)
            .await
            .unwrap();
        db.enqueue(w, &queue.name).await.unwrap();
    }

    let first_tick = db.start_queued_workflows(&queue).await.unwrap();
    assert_eq!(first_tick.len(), 1);

    cleanup_workflow(&db, &w1).await;
    cleanup_workflow(&db, &w2).await;
}

/// S3 — durable sleep idempotence: re-invoking `sleep` for the same
/// (workflow, function_id) after the end time was already journaled takes
/// the recorded end time rather than recomputing it from `seconds`.
#[tokio::test]
async fn s3_durable_sleep_is_idempotent_across_calls() {
    let Some(db) = connect().await else { return };
    let w = new_workflow_uuid();
    db.update_workflow_status(&new_status_row(&w, "s3"), false, false)
        .await
        .unwrap();

    let first = db.sleep(&w, 7, 10.0, true).await.unwrap();
    assert!((first - 10.0).abs() < 0.5);

    // A second call with a different `seconds` argument must still honor
    // the originally journaled end time, not restart a fresh 10s window.
    let second = db.sleep(&w, 7, 0.0, true).await.unwrap();
    assert!(second <= first);

    cleanup_workflow(&db, &w).await;
}

/// S5 — buffer flush ordering: buffering status then inputs for a temp
/// workflow must flush status first (so the FK from workflow_inputs is
/// satisfied) and the inputs flush must actually observe the flushed row.
#[tokio::test]
async fn s5_buffered_writer_flushes_status_before_inputs() {
    let Some(db) = connect().await else { return };
    let w = new_workflow_uuid();
    db.mark_temp_txn_workflow(&w);

    db.buffer_workflow_status(new_status_row(&w, "s5"));
    db.buffer_workflow_inputs(&w, "{\"args\":[],\"kwargs\":{}}".to_string());

    db.flush_workflow_buffers().await.unwrap();

    let status = db.get_workflow_status(&w).await.unwrap();
    assert!(status.is_some());

    let row: Option<(String,)> = sqlx::query_as("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
        .bind(&w)
        .fetch_optional(db.pool())
        .await
        .unwrap();
    assert!(row.is_some());

    cleanup_workflow(&db, &w).await;
}

/// C3 — application database transaction journal: `txn_id` is computed by
/// Postgres itself inside the INSERT, never supplied by the caller, and
/// `check_transaction_execution` sees it once the transaction commits.
#[tokio::test]
async fn appdb_records_transaction_output_with_server_assigned_txn_id() {
    use durable_sysdb::appdb::{AppDatabase, TransactionResult};

    let Some(url) = get_database_url() else {
        eprintln!("DATABASE_URL not set, skipping postgres integration test");
        return;
    };
    let app_db = AppDatabase::connect(&url).await.expect("connect to appdb");
    let sys_db = SystemDatabase::connect(&url).await.expect("connect to sysdb");
    let w = new_workflow_uuid();
    sys_db
        .update_workflow_status(&new_status_row(&w, "c3"), false, false)
        .await
        .unwrap();

    let mut tx = app_db.pool().begin().await.unwrap();
    app_db
        .record_transaction_output(
            &mut tx,
            &TransactionResult {
                workflow_uuid: w.clone(),
                function_id: 7,
                output: Some("\"ok\"".to_string()),
                error: None,
                txn_snapshot: "".to_string(),
                executor_id: Some("local".to_string()),
            },
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let (output, error) = app_db
        .check_transaction_execution(&w, 7)
        .await
        .unwrap()
        .expect("transaction output recorded");
    assert_eq!(output.as_deref(), Some("\"ok\""));
    assert!(error.is_none());

    let txn_id: (Option<String>,) =
        sqlx::query_as("SELECT txn_id FROM dbos.transaction_outputs WHERE workflow_uuid = $1 AND function_id = 7")
            .bind(&w)
            .fetch_one(app_db.pool())
            .await
            .unwrap();
    assert!(txn_id.0.is_some(), "txn_id should be server-assigned on commit");

    sqlx::query("DELETE FROM dbos.transaction_outputs WHERE workflow_uuid = $1")
        .bind(&w)
        .execute(app_db.pool())
        .await
        .ok();
    cleanup_workflow(&sys_db, &w).await;
}

/// S6 — startup recovery retries a workflow whose function isn't
/// registered yet, and succeeds once it is.
#[tokio::test]
async fn s6_recovery_retries_until_function_registered() {
    use async_trait::async_trait;
    use durable_sysdb::executor::{WorkflowExecutor, WorkflowHandle};
    use durable_sysdb::recovery::recover_pending_workflows;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyExecutor {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowExecutor for FlakyExecutor {
        async fn execute_by_id(
            &self,
            workflow_uuid: &str,
        ) -> Result<WorkflowHandle, durable_sysdb::error::SysDbError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(durable_sysdb::error::SysDbError::WorkflowFunctionNotFound(
                    workflow_uuid.to_string(),
                ));
            }
            Ok(WorkflowHandle {
                workflow_uuid: workflow_uuid.to_string(),
            })
        }

        async fn start_workflow(
            &self,
            name: &str,
            _queue_name: Option<&str>,
            _immediate_start: bool,
            _args: &str,
        ) -> Result<WorkflowHandle, durable_sysdb::error::SysDbError> {
            Ok(WorkflowHandle {
                workflow_uuid: name.to_string(),
            })
        }
    }

    let Some(db) = connect().await else { return };
    let w = new_workflow_uuid();
    let mut row = new_status_row(&w, "s6");
    row.executor_id = Some("recovery-test".to_string());
    db.update_workflow_status(&row, false, false).await.unwrap();

    let executor = FlakyExecutor {
        attempts: AtomicUsize::new(0),
    };

    // First pass hits WorkflowFunctionNotFound and propagates it (the
    // one-shot `recover_pending_workflows` surfaces the error directly;
    // the retry-with-backoff behavior lives in `spawn_recovery_loop`).
    let err = recover_pending_workflows(&db, &executor, "recovery-test")
        .await
        .unwrap_err();
    assert!(matches!(err, durable_sysdb::error::SysDbError::WorkflowFunctionNotFound(_)));

    // Second pass succeeds now that the "function" is considered registered.
    recover_pending_workflows(&db, &executor, "recovery-test")
        .await
        .unwrap();

    let after = db.get_workflow_status(&w).await.unwrap().unwrap();
    assert_eq!(after.recovery_attempts, 2);

    cleanup_workflow(&db, &w).await;
}
