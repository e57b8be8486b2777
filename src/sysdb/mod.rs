//! System database: status tracking, OAOO operation journal, notifications,
//! events, durable sleep, and the job queue.
//!
//! `SystemDatabase` owns the connection pool plus all in-process auxiliary
//! state (buffers, condition registries) for a single application process.
//! It has no knowledge of the application database; the two are wired
//! together by the executor that uses both.

mod buffer;
mod listener;
mod messaging;
mod operations;
mod queue;
mod status;

pub use operations::OperationResult;
pub use queue::{QueueRateLimit, QueueSpec};
pub use status::{new_workflow_uuid, GetWorkflowsFilter, WorkflowStatusRow, WorkflowStatusValue};

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::Notify;

use crate::config::{BufferConfig, PoolConfig};
use crate::error::SysDbError;
use crate::schema;

/// The system database handle. Cheap to clone: internal state is `Arc`-backed.
#[derive(Clone)]
pub struct SystemDatabase {
    pub(crate) pool: PgPool,
    pub(crate) inner: Arc<SystemDatabaseInner>,
}

pub(crate) struct SystemDatabaseInner {
    pub(crate) buffer_config: BufferConfig,

    /// Keyed by `"<workflow_uuid>::<topic>"` for notifications,
    /// `"<workflow_uuid>::<key>"` for workflow events.
    pub(crate) notifications_map: DashMap<String, Arc<Notify>>,
    pub(crate) workflow_events_map: DashMap<String, Arc<Notify>>,

    pub(crate) status_buffer: Mutex<std::collections::HashMap<String, WorkflowStatusRow>>,
    pub(crate) inputs_buffer: Mutex<std::collections::HashMap<String, String>>,
    pub(crate) temp_txn_wf_ids: Mutex<HashSet<String>>,
    pub(crate) exported_temp_txn_wf_status: Mutex<HashSet<String>>,
    pub(crate) is_flushing_status_buffer: std::sync::atomic::AtomicBool,
}

impl SystemDatabase {
    /// Connect to the system database, apply schema migrations, and start
    /// with empty buffers and condition registries.
    pub async fn connect(database_url: &str) -> Result<Self, SysDbError> {
        let pool_config = PoolConfig::default();
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .acquire_timeout(pool_config.acquire_timeout)
            .connect(database_url)
            .await?;
        schema::migrate_sysdb(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            inner: Arc::new(SystemDatabaseInner {
                buffer_config: BufferConfig::default(),
                notifications_map: DashMap::new(),
                workflow_events_map: DashMap::new(),
                status_buffer: Mutex::new(std::collections::HashMap::new()),
                inputs_buffer: Mutex::new(std::collections::HashMap::new()),
                temp_txn_wf_ids: Mutex::new(HashSet::new()),
                exported_temp_txn_wf_status: Mutex::new(HashSet::new()),
                is_flushing_status_buffer: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Mark a workflow as a single-transaction temp wrapper (§4.6): its
    /// status and inputs are buffered rather than written synchronously.
    pub fn mark_temp_txn_workflow(&self, workflow_uuid: &str) {
        self.inner
            .temp_txn_wf_ids
            .lock()
            .insert(workflow_uuid.to_string());
    }
}
