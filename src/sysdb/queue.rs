//! Queue dispatcher: admits enqueued workflows under per-queue concurrency
//! and rate limits.

use std::time::Duration;

use sqlx::Row;
use tracing::{debug, error, instrument};

use super::status::now_ms;
use super::SystemDatabase;
use crate::error::SysDbError;

/// `{limit, period}`: at most `limit` workflow starts per rolling `period`
/// seconds for a given queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueRateLimit {
    pub limit: i64,
    pub period_secs: f64,
}

/// A registered queue's admission policy.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub concurrency: Option<i64>,
    pub limiter: Option<QueueRateLimit>,
}

impl SystemDatabase {
    /// Per-enqueue: insert into `job_queue` (idempotent) and move the
    /// workflow into ENQUEUED status.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, workflow_uuid: &str, queue_name: &str) -> Result<(), SysDbError> {
        sqlx::query(
            r#"INSERT INTO dbos.job_queue (workflow_uuid, queue_name)
               VALUES ($1, $2) ON CONFLICT (workflow_uuid) DO NOTHING"#,
        )
        .bind(workflow_uuid)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;

        sqlx::query(r#"UPDATE dbos.workflow_status SET status = 'ENQUEUED' WHERE workflow_uuid = $1"#)
            .bind(workflow_uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `start_queued_workflows(queue)`: admit up to `concurrency` (and, if
    /// a rate limiter is set, up to the rolling-window budget) oldest
    /// ENQUEUED workflows, flipping them to PENDING via a compare-and-swap
    /// UPDATE. Returns the admitted workflow UUIDs.
    #[instrument(skip(self, queue))]
    pub async fn start_queued_workflows(
        &self,
        queue: &QueueSpec,
    ) -> Result<Vec<String>, SysDbError> {
        let room = match queue.limiter {
            Some(limiter) => {
                let started_in_window = self.count_started_in_window(&queue.name, limiter).await?;
                let limiter_room = (limiter.limit - started_in_window).max(0);
                match queue.concurrency {
                    Some(c) => limiter_room.min(c),
                    None => limiter_room,
                }
            }
            None => queue.concurrency.unwrap_or(i64::MAX),
        };
        if room <= 0 {
            return Ok(Vec::new());
        }

        let candidates = sqlx::query(
            r#"SELECT workflow_uuid FROM dbos.job_queue
               WHERE queue_name = $1
               ORDER BY created_at_epoch_ms ASC
               LIMIT $2"#,
        )
        .bind(&queue.name)
        .bind(room)
        .fetch_all(&self.pool)
        .await?;

        let mut admitted = Vec::new();
        for row in candidates {
            let workflow_uuid: String = row.get("workflow_uuid");
            let updated = sqlx::query(
                r#"UPDATE dbos.workflow_status SET status = 'PENDING'
                   WHERE workflow_uuid = $1 AND status = 'ENQUEUED'"#,
            )
            .bind(&workflow_uuid)
            .execute(&self.pool)
            .await?;
            if updated.rows_affected() == 1 {
                admitted.push(workflow_uuid);
            }
        }
        debug!(count = admitted.len(), queue = %queue.name, "admitted workflows");
        Ok(admitted)
    }

    async fn count_started_in_window(
        &self,
        queue_name: &str,
        limiter: QueueRateLimit,
    ) -> Result<i64, SysDbError> {
        let window_start = now_ms() - (limiter.period_secs * 1000.0) as i64;
        let row = sqlx::query(
            r#"SELECT COUNT(*) AS n FROM dbos.workflow_status
               WHERE queue_name = $1 AND status <> 'ENQUEUED' AND created_at >= $2"#,
        )
        .bind(queue_name)
        .bind(window_start)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("n"))
    }

    /// On completion, remove the job row. Failure is non-fatal: the CAS in
    /// `start_queued_workflows` already blocks re-admission.
    #[instrument(skip(self))]
    pub async fn remove_from_queue(&self, workflow_uuid: &str) -> Result<(), SysDbError> {
        if let Err(e) = sqlx::query(r#"DELETE FROM dbos.job_queue WHERE workflow_uuid = $1"#)
            .bind(workflow_uuid)
            .execute(&self.pool)
            .await
        {
            error!(workflow_uuid, error = %e, "failed to remove completed workflow from queue");
        }
        Ok(())
    }

    /// Spawn the dispatcher loop: every 1s, call `start_queued_workflows`
    /// for each registered queue and hand admitted IDs to `on_admitted`.
    pub fn spawn_queue_dispatcher<F>(
        &self,
        queues: Vec<QueueSpec>,
        on_admitted: F,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let db = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        for queue in &queues {
                            match db.start_queued_workflows(queue).await {
                                Ok(ids) => {
                                    for id in ids {
                                        on_admitted(id);
                                    }
                                }
                                Err(e) => {
                                    error!(queue = %queue.name, error = %e, "dispatcher tick failed");
                                }
                            }
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}
