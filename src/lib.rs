//! Durable execution core
//!
//! Persistence and coordination layer that turns application procedures
//! into workflows whose execution survives process crashes: status
//! tracking, the once-and-only-once (OAOO) operation journal, inter-
//! workflow messaging and events, durable sleep, the job queue, and
//! startup recovery.
//!
//! The decorator/registration surface, HTTP integration, and config-file
//! parsing that an application builds on top of this are external; this
//! crate exposes [`executor::WorkflowExecutor`] as the seam they implement.

pub mod appdb;
pub mod config;
pub mod error;
pub mod executor;
pub mod recovery;
pub mod schema;
pub mod serializer;
pub mod sysdb;

pub mod prelude {
    pub use crate::appdb::{AppDatabase, TransactionResult};
    pub use crate::config::{DatabaseConfig, PoolConfig};
    pub use crate::error::SysDbError;
    pub use crate::executor::{WorkflowExecutor, WorkflowHandle};
    pub use crate::sysdb::{
        GetWorkflowsFilter, QueueRateLimit, QueueSpec, SystemDatabase, WorkflowStatusRow,
        WorkflowStatusValue,
    };
}
