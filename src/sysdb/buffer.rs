//! Buffered writer: batches status/inputs writes from high-frequency step
//! journaling. Status is always flushed before inputs in the same pass,
//! because `workflow_inputs` has a foreign key to `workflow_status`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use super::status::WorkflowStatusRow;
use super::SystemDatabase;
use crate::error::SysDbError;

impl SystemDatabase {
    /// Buffer a status row for the next flush pass instead of writing it
    /// synchronously.
    pub fn buffer_workflow_status(&self, row: WorkflowStatusRow) {
        self.inner
            .status_buffer
            .lock()
            .insert(row.workflow_uuid.clone(), row);
    }

    /// Buffer a serialized inputs blob for the next flush pass.
    pub fn buffer_workflow_inputs(&self, workflow_uuid: &str, inputs: String) {
        self.inner
            .inputs_buffer
            .lock()
            .insert(workflow_uuid.to_string(), inputs);
    }

    fn is_buffers_empty(&self) -> bool {
        self.inner.status_buffer.lock().is_empty() && self.inner.inputs_buffer.lock().is_empty()
    }

    /// Spin (1s polls) until no flush is in progress and both buffers are
    /// empty. Used by shutdown.
    pub async fn wait_for_buffer_flush(&self) {
        loop {
            if !self.inner.is_flushing_status_buffer.load(Ordering::SeqCst) && self.is_buffers_empty()
            {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// One flush pass: drain up to `buffer_flush_batch_size` entries from
    /// each buffer, status first, inputs second. On DB error, the popped
    /// entries are restored to the buffer for the next pass.
    #[instrument(skip(self))]
    pub async fn flush_workflow_buffers(&self) -> Result<(), SysDbError> {
        self.inner.is_flushing_status_buffer.store(true, Ordering::SeqCst);
        let result = self.flush_status_buffer().await;
        self.inner.is_flushing_status_buffer.store(false, Ordering::SeqCst);
        result?;
        self.flush_inputs_buffer().await?;
        Ok(())
    }

    /// Flushes the whole batch in one transaction: either every popped row
    /// lands, or (on any error) none does and the whole popped set is
    /// restored to the buffer for the next pass.
    async fn flush_status_buffer(&self) -> Result<(), SysDbError> {
        let batch_size = self.inner.buffer_config.flush_batch_size;
        let popped: Vec<(String, WorkflowStatusRow)> = {
            let mut buffer = self.inner.status_buffer.lock();
            let keys: Vec<String> = buffer.keys().take(batch_size).cloned().collect();
            keys.into_iter()
                .filter_map(|k| buffer.remove(&k).map(|v| (k, v)))
                .collect()
        };
        if popped.is_empty() {
            return Ok(());
        }

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "status flush failed to start transaction, re-queuing batch");
                let mut buffer = self.inner.status_buffer.lock();
                for (uuid, row) in popped {
                    buffer.insert(uuid, row);
                }
                return Err(e.into());
            }
        };

        let mut result = Ok(());
        for (_, row) in &popped {
            if let Err(e) = SystemDatabase::update_workflow_status_tx(&mut tx, row, true, false).await {
                result = Err(e);
                break;
            }
        }

        match result {
            Ok(()) => match tx.commit().await {
                Ok(()) => {
                    let mut exported = self.inner.exported_temp_txn_wf_status.lock();
                    for (uuid, _) in &popped {
                        exported.insert(uuid.clone());
                    }
                    debug!("flushed status buffer");
                    Ok(())
                }
                Err(e) => {
                    warn!(error = %e, "status flush commit failed, re-queuing batch");
                    let mut buffer = self.inner.status_buffer.lock();
                    for (uuid, row) in popped {
                        buffer.insert(uuid, row);
                    }
                    Err(e.into())
                }
            },
            Err(e) => {
                warn!(error = %e, "status flush failed, re-queuing batch");
                // tx dropped here without committing, rolling back any rows
                // already applied earlier in this loop iteration.
                let mut buffer = self.inner.status_buffer.lock();
                for (uuid, row) in popped {
                    buffer.insert(uuid, row);
                }
                Err(e)
            }
        }
    }

    async fn flush_inputs_buffer(&self) -> Result<(), SysDbError> {
        let batch_size = self.inner.buffer_config.flush_batch_size;
        let eligible: Vec<String> = {
            let buffer = self.inner.inputs_buffer.lock();
            let temp_ids = self.inner.temp_txn_wf_ids.lock();
            let exported = self.inner.exported_temp_txn_wf_status.lock();
            buffer
                .keys()
                .filter(|uuid| !temp_ids.contains(*uuid) || exported.contains(*uuid))
                .take(batch_size)
                .cloned()
                .collect()
        };
        if eligible.is_empty() {
            return Ok(());
        }

        let mut popped: HashMap<String, String> = HashMap::new();
        {
            let mut buffer = self.inner.inputs_buffer.lock();
            for uuid in &eligible {
                if let Some(inputs) = buffer.remove(uuid) {
                    popped.insert(uuid.clone(), inputs);
                }
            }
        }

        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "inputs flush failed to start transaction, re-queuing batch");
                let mut buffer = self.inner.inputs_buffer.lock();
                for (uuid, inputs) in popped {
                    buffer.insert(uuid, inputs);
                }
                return Err(e.into());
            }
        };

        let mut result = Ok(());
        for (uuid, inputs) in &popped {
            if let Err(e) = sqlx::query(
                r#"INSERT INTO dbos.workflow_inputs (workflow_uuid, inputs)
                   VALUES ($1, $2) ON CONFLICT (workflow_uuid) DO NOTHING"#,
            )
            .bind(uuid)
            .bind(inputs)
            .execute(&mut *tx)
            .await
            {
                result = Err(e);
                break;
            }
        }

        match result {
            Ok(()) => match tx.commit().await {
                Ok(()) => {
                    debug!("flushed inputs buffer");
                    Ok(())
                }
                Err(e) => {
                    error!(error = %e, "inputs flush commit failed, re-queuing batch");
                    let mut buffer = self.inner.inputs_buffer.lock();
                    for (uuid, inputs) in popped {
                        buffer.insert(uuid, inputs);
                    }
                    Err(e.into())
                }
            },
            Err(e) => {
                error!(error = %e, "inputs flush failed, re-queuing batch");
                let mut buffer = self.inner.inputs_buffer.lock();
                for (uuid, inputs) in popped {
                    buffer.insert(uuid, inputs);
                }
                Err(e.into())
            }
        }
    }

    /// Spawn the background flush loop. Ticks every `buffer_flush_interval`
    /// until `shutdown` fires.
    pub fn spawn_buffer_flush_loop(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let db = self.clone();
        let interval = self.inner.buffer_config.flush_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = db.flush_workflow_buffers().await {
                            error!(error = %e, "buffer flush pass failed");
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
