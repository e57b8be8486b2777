//! The workflow executor interface (C9)
//!
//! The decorator/registration surface, invocation semantics, and the
//! per-workflow step counter all live in application code. This crate
//! only defines the callback shape the queue dispatcher and recovery
//! engine drive workflows through.

use async_trait::async_trait;

use crate::error::SysDbError;

/// A running or completed workflow, as handed back by the executor.
#[derive(Debug)]
pub struct WorkflowHandle {
    pub workflow_uuid: String,
}

/// Implemented by application code. The dispatcher (C7) and recovery
/// engine (C8) call into this trait; they never touch workflow code
/// directly.
#[async_trait]
pub trait WorkflowExecutor: Send + Sync {
    /// Re-drive a known workflow by UUID, e.g. on recovery or queue
    /// admission. Returns `WorkflowFunctionNotFound` if the workflow's
    /// function has not been registered in this process yet.
    async fn execute_by_id(&self, workflow_uuid: &str) -> Result<WorkflowHandle, SysDbError>;

    /// Enqueue or immediately start a new workflow invocation.
    async fn start_workflow(
        &self,
        name: &str,
        queue_name: Option<&str>,
        immediate_start: bool,
        args: &str,
    ) -> Result<WorkflowHandle, SysDbError>;
}

#[cfg(test)]
pub mod test_double {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory executor double: registered names succeed, everything
    /// else returns `WorkflowFunctionNotFound` so recovery-retry behavior
    /// can be exercised without real workflow code.
    #[derive(Default)]
    pub struct TestExecutor {
        registered: Mutex<HashMap<String, bool>>,
    }

    impl TestExecutor {
        pub fn register(&self, name: &str) {
            self.registered.lock().unwrap().insert(name.to_string(), true);
        }
    }

    #[async_trait]
    impl WorkflowExecutor for TestExecutor {
        async fn execute_by_id(&self, workflow_uuid: &str) -> Result<WorkflowHandle, SysDbError> {
            if self.registered.lock().unwrap().contains_key(workflow_uuid) {
                Ok(WorkflowHandle {
                    workflow_uuid: workflow_uuid.to_string(),
                })
            } else {
                Err(SysDbError::WorkflowFunctionNotFound(workflow_uuid.to_string()))
            }
        }

        async fn start_workflow(
            &self,
            name: &str,
            _queue_name: Option<&str>,
            _immediate_start: bool,
            _args: &str,
        ) -> Result<WorkflowHandle, SysDbError> {
            Ok(WorkflowHandle {
                workflow_uuid: name.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn unregistered_workflow_reports_not_found() {
        let exec = TestExecutor::default();
        let err = exec.execute_by_id("w1").await.unwrap_err();
        assert!(matches!(err, SysDbError::WorkflowFunctionNotFound(_)));
    }

    #[tokio::test]
    async fn registered_workflow_executes() {
        let exec = TestExecutor::default();
        exec.register("w1");
        let handle = exec.execute_by_id("w1").await.unwrap();
        assert_eq!(handle.workflow_uuid, "w1");
    }
}
