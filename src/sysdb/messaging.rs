//! Inter-workflow messaging (send/recv), workflow events, and durable sleep

use std::sync::Arc;
use std::time::Duration;

use sqlx::Row;
use tokio::sync::Notify;
use tracing::instrument;

use super::operations::OperationResult;
use super::status::now_ms;
use super::SystemDatabase;
use crate::error::SysDbError;
use crate::serializer;

/// Topic used when the caller does not specify one.
pub const NULL_TOPIC: &str = "__null__topic__";

fn notification_key(workflow_uuid: &str, topic: &str) -> String {
    format!("{workflow_uuid}::{topic}")
}

impl SystemDatabase {
    fn notify_waiter(map: &dashmap::DashMap<String, Arc<Notify>>, key: &str) {
        if let Some(notify) = map.get(key) {
            notify.notify_waiters();
        }
    }

    fn register_waiter(
        map: &dashmap::DashMap<String, Arc<Notify>>,
        key: &str,
    ) -> Arc<Notify> {
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// `send(caller_wf, caller_fn, dest_uuid, message, topic?)`. Runs the
    /// OAOO check, the notification insert, and the OAOO record as one
    /// transaction so a crash between them can never leave a notification
    /// inserted without its journal entry (which would cause a retry to
    /// insert a duplicate).
    #[instrument(skip(self, message))]
    pub async fn send(
        &self,
        caller_wf: &str,
        caller_fn: i64,
        dest_uuid: &str,
        message: &str,
        topic: Option<&str>,
    ) -> Result<(), SysDbError> {
        let topic = topic.unwrap_or(NULL_TOPIC);
        let mut tx = self.pool.begin().await?;

        if Self::check_operation_execution_tx(&mut tx, caller_wf, caller_fn)
            .await?
            .is_some()
        {
            tx.commit().await?;
            return Ok(());
        }

        let insert = sqlx::query(
            r#"INSERT INTO dbos.notifications (destination_uuid, topic, message)
               VALUES ($1, $2, $3)"#,
        )
        .bind(dest_uuid)
        .bind(topic)
        .bind(message)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            return Err(SysDbError::from_insert_error(
                e,
                uuid::Uuid::parse_str(dest_uuid).unwrap_or_else(|_| uuid::Uuid::nil()),
            ));
        }

        Self::record_operation_result_tx(
            &mut tx,
            &OperationResult {
                workflow_uuid: caller_wf.to_string(),
                function_id: caller_fn,
                output: None,
                error: None,
            },
        )
        .await?;

        tx.commit().await?;

        // The trigger in schema.rs already fires NOTIFY; locally registered
        // waiters are additionally nudged here in case this process also
        // holds the recv side (same-process send/recv round-trip).
        Self::notify_waiter(&self.inner.notifications_map, &notification_key(dest_uuid, topic));
        Ok(())
    }

    /// `recv(caller_wf, caller_fn, topic?, timeout_s)`. Six-step protocol
    /// per the messaging contract: OAOO check, register condition before
    /// probing the table (never after), durable-sleep for the timeout,
    /// wait on the condition, then a FIFO delete-and-return.
    #[instrument(skip(self))]
    pub async fn recv(
        &self,
        caller_wf: &str,
        caller_fn: i64,
        topic: Option<&str>,
        timeout_fn: i64,
        timeout_s: f64,
    ) -> Result<Option<String>, SysDbError> {
        if let Some(recorded) = self.check_operation_execution(caller_wf, caller_fn).await? {
            return Ok(match recorded.output {
                Some(text) => serializer::deserialize(&text)?,
                None => None,
            });
        }

        let topic = topic.unwrap_or(NULL_TOPIC).to_string();
        let key = notification_key(caller_wf, &topic);
        let notify = Self::register_waiter(&self.inner.notifications_map, &key);

        let existing = self.peek_notification(caller_wf, &topic).await?;
        if existing.is_none() {
            let wait_secs = self.sleep(caller_wf, timeout_fn, timeout_s, true).await?;
            let _ = tokio::time::timeout(Duration::from_secs_f64(wait_secs), notify.notified())
                .await;
        }
        self.inner.notifications_map.remove(&key);

        let message = self.pop_notification(caller_wf, &topic).await?;
        let serialized = serializer::serialize(&message)?;
        self.record_operation_result(&OperationResult {
            workflow_uuid: caller_wf.to_string(),
            function_id: caller_fn,
            output: Some(serialized),
            error: None,
        })
        .await?;
        Ok(message)
    }

    async fn peek_notification(
        &self,
        destination: &str,
        topic: &str,
    ) -> Result<Option<String>, SysDbError> {
        let row = sqlx::query(
            r#"SELECT message FROM dbos.notifications
               WHERE destination_uuid = $1 AND topic = $2
               ORDER BY created_at_epoch_ms ASC LIMIT 1"#,
        )
        .bind(destination)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("message")))
    }

    /// Oldest-first delete-and-return, in its own transaction.
    async fn pop_notification(
        &self,
        destination: &str,
        topic: &str,
    ) -> Result<Option<String>, SysDbError> {
        let row = sqlx::query(
            r#"
            WITH oldest AS (
                SELECT ctid FROM dbos.notifications
                WHERE destination_uuid = $1 AND topic = $2
                ORDER BY created_at_epoch_ms ASC
                LIMIT 1
            )
            DELETE FROM dbos.notifications
            WHERE ctid IN (SELECT ctid FROM oldest)
            RETURNING message
            "#,
        )
        .bind(destination)
        .bind(topic)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("message")))
    }

    /// `set_event(wf, fn, key, message)`.
    #[instrument(skip(self, message))]
    pub async fn set_event(
        &self,
        wf: &str,
        function_id: i64,
        key: &str,
        message: &str,
    ) -> Result<(), SysDbError> {
        if self
            .check_operation_execution(wf, function_id)
            .await?
            .is_some()
        {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_events (workflow_uuid, key, value)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_uuid, key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(wf)
        .bind(key)
        .bind(message)
        .execute(&self.pool)
        .await?;

        self.record_operation_result(&OperationResult {
            workflow_uuid: wf.to_string(),
            function_id,
            output: None,
            error: None,
        })
        .await?;

        Self::notify_waiter(&self.inner.workflow_events_map, &notification_key(wf, key));
        Ok(())
    }

    /// `get_event(target_uuid, key, timeout_s, caller_ctx?)`.
    #[instrument(skip(self))]
    pub async fn get_event(
        &self,
        target_uuid: &str,
        key: &str,
        timeout_s: f64,
        caller_ctx: Option<(&str, i64)>,
    ) -> Result<Option<String>, SysDbError> {
        if let Some((caller_wf, caller_fn)) = caller_ctx {
            if let Some(recorded) = self.check_operation_execution(caller_wf, caller_fn).await? {
                return Ok(match recorded.output {
                    Some(text) => serializer::deserialize(&text)?,
                    None => None,
                });
            }
        }

        let map_key = notification_key(target_uuid, key);
        let notify = Self::register_waiter(&self.inner.workflow_events_map, &map_key);

        let mut value = self.read_event(target_uuid, key).await?;
        if value.is_none() {
            let wait_secs = match caller_ctx {
                Some((caller_wf, timeout_fn)) => self.sleep(caller_wf, timeout_fn, timeout_s, true).await?,
                None => timeout_s,
            };
            let _ = tokio::time::timeout(Duration::from_secs_f64(wait_secs), notify.notified())
                .await;
            value = self.read_event(target_uuid, key).await?;
        }
        self.inner.workflow_events_map.remove(&map_key);

        if let Some((caller_wf, caller_fn)) = caller_ctx {
            let serialized = serializer::serialize(&value)?;
            self.record_operation_result(&OperationResult {
                workflow_uuid: caller_wf.to_string(),
                function_id: caller_fn,
                output: Some(serialized),
                error: None,
            })
            .await?;
        }
        Ok(value)
    }

    async fn read_event(&self, workflow_uuid: &str, key: &str) -> Result<Option<String>, SysDbError> {
        let row = sqlx::query(
            r#"SELECT value FROM dbos.workflow_events WHERE workflow_uuid = $1 AND key = $2"#,
        )
        .bind(workflow_uuid)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Durable sleep: idempotent across crash/resume. The end time is
    /// computed and journaled on first call; a re-execution takes the
    /// journaled end time rather than recomputing from `seconds`. Returns
    /// the effective remaining duration; blocks for it unless `skip_sleep`.
    #[instrument(skip(self))]
    pub async fn sleep(
        &self,
        wf: &str,
        function_id: i64,
        seconds: f64,
        skip_sleep: bool,
    ) -> Result<f64, SysDbError> {
        let end_ms = match self.check_operation_execution(wf, function_id).await? {
            Some(recorded) => match recorded.output {
                Some(text) => serializer::deserialize::<i64>(&text)?.unwrap_or_else(now_ms),
                None => now_ms(),
            },
            None => {
                let end = now_ms() + (seconds * 1000.0) as i64;
                let result = self
                    .record_operation_result(&OperationResult {
                        workflow_uuid: wf.to_string(),
                        function_id,
                        output: Some(serializer::serialize(&end)?),
                        error: None,
                    })
                    .await;
                // Concurrent journalers agree on the same end time; swallow.
                match result {
                    Ok(()) => end,
                    Err(SysDbError::WorkflowConflict(_)) => {
                        match self.check_operation_execution(wf, function_id).await? {
                            Some(recorded) => recorded
                                .output
                                .and_then(|t| serializer::deserialize::<i64>(&t).ok().flatten())
                                .unwrap_or(end),
                            None => end,
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let remaining = ((end_ms - now_ms()).max(0)) as f64 / 1000.0;
        if !skip_sleep && remaining > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(remaining)).await;
        }
        Ok(remaining)
    }
}
