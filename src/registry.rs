//! Background task registry.
//!
//! Each live work order owns exactly one spawned task. The registry lets an
//! operator enumerate in-flight work, and - together with the error-handling
//! wrapper and a monitor task - guarantees a terminal status gets recorded
//! even when the orchestrator crashes before its own failure path runs.
//! Nothing ever synchronously waits on these tasks from a request handler.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

use crate::{
    models::{StatusUpdate, WorkOrderStatus},
    state::WorkOrderRepository,
    util::ResultExt as _,
    workflow::{WorkflowOrchestrator, WorkflowRequest},
};

#[derive(Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn contains(&self, work_order_id: &str) -> bool {
        self.tasks.lock().contains_key(work_order_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.tasks.lock().keys().cloned().collect()
    }

    fn remove(&self, work_order_id: &str) {
        self.tasks.lock().remove(work_order_id);
        debug!(work_order_id, "workflow_task_removed_from_registry");
    }

    /// Spawn the workflow as a tracked background task.
    ///
    /// Layer 2 of the failure defense: the wrapper catches whatever escapes
    /// the orchestrator, records a clearly prefixed failed status, and
    /// re-raises so the task's outcome stays observable. Layer 3 is the
    /// monitor, which also catches panics and only writes `failed` when the
    /// orchestrator didn't get there itself.
    pub fn spawn_workflow(
        self: &Arc<Self>,
        orchestrator: Arc<WorkflowOrchestrator>,
        state: Arc<dyn WorkOrderRepository>,
        request: WorkflowRequest,
    ) {
        let work_order_id = request.work_order_id.clone();

        let inner = {
            let state = state.clone();
            let id = work_order_id.clone();
            tokio::spawn(async move {
                match orchestrator.execute_workflow(request).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        error!(
                            work_order_id = %id,
                            error = %err,
                            "workflow_execution_unhandled_error"
                        );
                        state
                            .update_status(
                                &id,
                                WorkOrderStatus::Failed,
                                StatusUpdate::error(format!(
                                    "Workflow execution failed before orchestrator could \
                                     handle it: {err}"
                                )),
                            )
                            .await
                            .or_log_error("recording failure after unhandled workflow error");
                        Err(err)
                    }
                }
            })
        };

        self.tasks
            .lock()
            .insert(work_order_id.clone(), inner.abort_handle());
        debug!(
            work_order_id = %work_order_id,
            task_count = self.len() as u64,
            "workflow_task_created_and_tracked"
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => {
                    // Terminal status was already written by the
                    // orchestrator (or its wrapper).
                    info!(work_order_id = %work_order_id, "workflow_task_completed");
                }
                Ok(Err(err)) => {
                    error!(
                        work_order_id = %work_order_id,
                        error = %err,
                        "workflow_task_failed"
                    );
                    mark_failed_if_needed(&*state, &work_order_id, &err.to_string()).await;
                }
                Err(join_err) => {
                    error!(
                        work_order_id = %work_order_id,
                        error = %join_err,
                        "workflow_task_failed"
                    );
                    mark_failed_if_needed(
                        &*state,
                        &work_order_id,
                        &format!("Workflow task failed: {join_err}"),
                    )
                    .await;
                }
            }
            registry.remove(&work_order_id);
        });
    }
}

// Drive the status to failed unless the orchestrator's own handler already
// did; errors here are logged and dropped - the task is already dead.
async fn mark_failed_if_needed(
    state: &dyn WorkOrderRepository,
    work_order_id: &str,
    message: &str,
) {
    let current = match state.get(work_order_id).await {
        Ok(Some((_, metadata))) => metadata.status,
        Ok(None) => return,
        Err(err) => {
            error!(work_order_id, error = %err, "workflow_status_lookup_failed_in_callback");
            return;
        }
    };
    if current == WorkOrderStatus::Failed {
        return;
    }
    state
        .update_status(
            work_order_id,
            WorkOrderStatus::Failed,
            StatusUpdate::error(message),
        )
        .await
        .or_log_error("updating status from task callback");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::test_utils::test_config,
        models::{SandboxKind, WorkOrderMetadata, WorkOrderState},
        state::InMemoryRepository,
    };

    async fn wait_until_empty(registry: &TaskRegistry) {
        for _ in 0..200 {
            if registry.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("registry never drained: {:?}", registry.active_ids());
    }

    // A workflow that dies in sandbox setup still ends with a terminal
    // failed status and an empty registry.
    #[tokio::test]
    async fn test_failed_workflow_reaches_terminal_status() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let state: Arc<dyn WorkOrderRepository> = Arc::new(InMemoryRepository::new());
        let orchestrator = Arc::new(WorkflowOrchestrator::new(config, state.clone()));
        let registry = TaskRegistry::new();

        state
            .create(
                WorkOrderState::new("wo-regtest1".into(), "/nonexistent/repo".into()),
                WorkOrderMetadata::new(SandboxKind::Clone, None),
            )
            .await
            .unwrap();

        registry.spawn_workflow(
            orchestrator,
            state.clone(),
            WorkflowRequest {
                work_order_id: "wo-regtest1".into(),
                repository_url: "/nonexistent/repo".into(),
                sandbox_type: SandboxKind::Clone,
                user_request: "do things".into(),
                selected_commands: None,
                github_issue_number: None,
            },
        );
        assert!(registry.contains("wo-regtest1"));

        wait_until_empty(&registry).await;
        let (_, metadata) = state.get("wo-regtest1").await.unwrap().unwrap();
        assert_eq!(metadata.status, WorkOrderStatus::Failed);
        let error = metadata.error_message.unwrap();
        assert!(!error.is_empty());
    }

    // The placeholder sandbox kinds fail fast through the same machinery.
    #[tokio::test]
    async fn test_placeholder_sandbox_fails_closed() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let state: Arc<dyn WorkOrderRepository> = Arc::new(InMemoryRepository::new());
        let orchestrator = Arc::new(WorkflowOrchestrator::new(config, state.clone()));
        let registry = TaskRegistry::new();

        state
            .create(
                WorkOrderState::new("wo-regtest2".into(), "url".into()),
                WorkOrderMetadata::new(SandboxKind::E2b, None),
            )
            .await
            .unwrap();

        registry.spawn_workflow(
            orchestrator,
            state.clone(),
            WorkflowRequest {
                work_order_id: "wo-regtest2".into(),
                repository_url: "url".into(),
                sandbox_type: SandboxKind::E2b,
                user_request: "x".into(),
                selected_commands: None,
                github_issue_number: None,
            },
        );
        wait_until_empty(&registry).await;

        let (_, metadata) = state.get("wo-regtest2").await.unwrap().unwrap();
        assert_eq!(metadata.status, WorkOrderStatus::Failed);
        assert!(
            metadata.error_message.unwrap().contains("not implemented"),
        );
    }
}
