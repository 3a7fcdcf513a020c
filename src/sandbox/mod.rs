//! Isolated checkouts for agent execution.
//!
//! A sandbox owns one working copy of the target repository for the
//! lifetime of one workflow run: `setup` materializes it, `execute_command`
//! runs shell commands inside it, `cleanup` tears it down. Tagged variants
//! behind a factory rather than inheritance; the reserved kinds fail fast
//! with "not implemented" so a typo'd request doesn't get half a workflow
//! in before falling over.

mod clone;
mod worktree;

use std::{
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tracing::{error, info};

pub use clone::CloneSandbox;
pub use worktree::WorktreeSandbox;

use crate::{
    config::Config,
    errors::WorkOrderError,
    models::{CommandOutcome, SandboxKind},
    process::{self, Communicated},
};

#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    fn identifier(&self) -> &str;

    /// Directory commands run in. Only valid between `setup` and `cleanup`.
    fn working_dir(&self) -> &Path;

    /// Materialize the working copy. Does NOT create a feature branch; the
    /// agent does that itself during the workflow.
    async fn setup(&self) -> Result<(), WorkOrderError>;

    /// Run a shell command inside the sandbox with a timeout.
    async fn execute_command(&self, command: &str, timeout: Duration) -> CommandOutcome;

    /// The branch currently checked out, if any.
    async fn git_branch_name(&self) -> Option<String>;

    async fn cleanup(&self) -> Result<(), WorkOrderError>;
}

/// Select a sandbox backend for the work order.
pub fn create_sandbox(
    config: Arc<Config>,
    kind: SandboxKind,
    repository_url: &str,
    work_order_id: &str,
) -> Result<Box<dyn Sandbox>, WorkOrderError> {
    match kind {
        SandboxKind::Clone => Ok(Box::new(CloneSandbox::new(
            config,
            repository_url.to_string(),
            work_order_id,
        ))),
        SandboxKind::Worktree => Ok(Box::new(WorktreeSandbox::new(
            config,
            repository_url.to_string(),
            work_order_id,
        ))),
        SandboxKind::E2b | SandboxKind::Dagger => Err(WorkOrderError::SandboxSetup(format!(
            "{kind} sandbox is not implemented"
        ))),
    }
}

// Both backends execute commands the same way; only the directory differs.
pub(crate) async fn run_in_dir(command: &str, dir: &Path, timeout: Duration) -> CommandOutcome {
    info!(command, "command_execution_started");
    let started = Instant::now();
    let result = process::communicate(process::shell(command, dir), None, Some(timeout)).await;
    let duration = started.elapsed().as_secs_f64();

    match result {
        Err(err) => {
            error!(command, error = %err, "command_execution_error");
            CommandOutcome {
                success: false,
                exit_code: -1,
                error_message: Some(err.to_string()),
                duration_seconds: duration,
                ..CommandOutcome::default()
            }
        }
        Ok(Communicated::TimedOut) => {
            error!(command, timeout_seconds = timeout.as_secs(), "command_execution_timeout");
            CommandOutcome {
                success: false,
                exit_code: -1,
                error_message: Some(
                    WorkOrderError::Timeout {
                        seconds: timeout.as_secs(),
                    }
                    .to_string(),
                ),
                duration_seconds: duration,
                ..CommandOutcome::default()
            }
        }
        Ok(Communicated::Finished {
            exit_code,
            stdout,
            stderr,
        }) => {
            let success = exit_code == 0;
            if success {
                info!(command, duration, "command_execution_completed");
            } else {
                error!(command, exit_code, duration, "command_execution_failed");
            }
            CommandOutcome {
                success,
                error_message: if success {
                    None
                } else if stderr.is_empty() {
                    Some("Command failed".to_string())
                } else {
                    Some(stderr.clone())
                },
                stdout: Some(stdout),
                stderr: Some(stderr),
                exit_code,
                session_id: None,
                result_text: None,
                duration_seconds: duration,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::test_utils::test_config, git::test_utils::TempRepo};

    #[test]
    fn test_factory_rejects_placeholder_kinds() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        for kind in [SandboxKind::E2b, SandboxKind::Dagger] {
            let err = create_sandbox(config.clone(), kind, "url", "wo-1234abcd").unwrap_err();
            assert!(
                err.to_string().contains("not implemented"),
                "unexpected error: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_clone_sandbox_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let origin = TempRepo::new().await.unwrap();
        origin.commit_file("README.md", "hi").await.unwrap();

        let sandbox =
            create_sandbox(config, SandboxKind::Clone, &origin.url(), "wo-c10c10c1").unwrap();
        assert_eq!(sandbox.identifier(), "sandbox-wo-c10c10c1");
        sandbox.setup().await.unwrap();
        assert!(sandbox.working_dir().join("README.md").exists());
        assert_eq!(sandbox.git_branch_name().await.as_deref(), Some("main"));

        let outcome = sandbox
            .execute_command("cat README.md", Duration::from_secs(10))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.stdout.as_deref(), Some("hi"));

        let outcome = sandbox
            .execute_command("exit 4", Duration::from_secs(10))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, 4);

        sandbox.cleanup().await.unwrap();
        assert!(!sandbox.working_dir().exists());
        // Cleaning an already-clean sandbox is fine.
        sandbox.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_sandbox_setup_failure() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let sandbox = create_sandbox(
            config,
            SandboxKind::Clone,
            "/nonexistent/repository/path",
            "wo-badbadba",
        )
        .unwrap();
        let err = sandbox.setup().await.unwrap_err();
        assert!(matches!(err, WorkOrderError::SandboxSetup(_)));
    }

    #[tokio::test]
    async fn test_worktree_sandbox_lifecycle() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let origin = TempRepo::new().await.unwrap();
        origin.commit_file("README.md", "hello").await.unwrap();

        let sandbox =
            create_sandbox(config, SandboxKind::Worktree, &origin.url(), "wo-abcdef01").unwrap();
        sandbox.setup().await.unwrap();
        assert!(sandbox.working_dir().join("README.md").exists());
        // The initial branch is the work order id; the agent renames it
        // into something meaningful later.
        assert_eq!(sandbox.git_branch_name().await.as_deref(), Some("wo-abcdef01"));
        // Port range got materialized for whatever the agent builds here.
        let ports_env =
            std::fs::read_to_string(sandbox.working_dir().join(".ports.env")).unwrap();
        assert!(ports_env.contains("PORT_RANGE_SIZE=10"), "{ports_env}");

        // Setup is idempotent across a retry.
        sandbox.setup().await.unwrap();
        assert!(sandbox.working_dir().join("README.md").exists());

        sandbox.cleanup().await.unwrap();
        assert!(!sandbox.working_dir().exists());
    }

    #[tokio::test]
    async fn test_command_timeout_in_sandbox() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(test_config(temp.path()));
        let origin = TempRepo::new().await.unwrap();
        origin.commit("init").await.unwrap();

        let sandbox =
            create_sandbox(config, SandboxKind::Clone, &origin.url(), "wo-51ee51ee").unwrap();
        sandbox.setup().await.unwrap();
        let outcome = sandbox
            .execute_command("sleep 30", Duration::from_millis(200))
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.error_message.unwrap().contains("timed out"));
        sandbox.cleanup().await.unwrap();
    }
}
