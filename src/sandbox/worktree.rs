//! Worktree sandbox: a linked checkout off the cached base clone, plus a
//! deterministic port-range allocation exported via `.ports.env`. This is
//! the backend that makes many concurrent work orders on one repository
//! cheap: one object database, one fetch, N worktrees.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tracing::info;

use super::{run_in_dir, Sandbox};
use crate::{
    config::Config,
    errors::WorkOrderError,
    git,
    models::CommandOutcome,
    ports, util, worktree,
};

#[derive(Debug)]
pub struct WorktreeSandbox {
    config: Arc<Config>,
    repository_url: String,
    work_order_id: String,
    identifier: String,
    working_dir: PathBuf,
}

impl WorktreeSandbox {
    pub fn new(config: Arc<Config>, repository_url: String, work_order_id: &str) -> Self {
        let working_dir = worktree::worktree_path(&config, &repository_url, work_order_id);
        Self {
            config,
            identifier: util::sandbox_identifier(work_order_id),
            repository_url,
            work_order_id: work_order_id.to_string(),
            working_dir,
        }
    }
}

#[async_trait]
impl Sandbox for WorktreeSandbox {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn setup(&self) -> Result<(), WorkOrderError> {
        info!(sandbox_identifier = %self.identifier, "worktree_sandbox_setup_started");

        let range = ports::find_available_port_range(&self.work_order_id)?;
        info!(
            port_range_start = range.start,
            port_range_end = range.end,
            available = range.available.len(),
            "ports_allocated"
        );

        // The initial branch is just the work order id; the create-branch
        // step renames the work onto a meaningful branch later.
        let path = worktree::create_worktree(
            &self.config,
            &self.repository_url,
            &self.work_order_id,
            &self.work_order_id,
        )
        .await?;

        ports::write_ports_env(&path, &range).map_err(|e| {
            WorkOrderError::SandboxSetup(format!("writing .ports.env: {e}"))
        })?;

        info!(
            working_dir = %path.display(),
            "worktree_sandbox_setup_completed"
        );
        Ok(())
    }

    async fn execute_command(&self, command: &str, timeout: Duration) -> CommandOutcome {
        run_in_dir(command, &self.working_dir, timeout).await
    }

    async fn git_branch_name(&self) -> Option<String> {
        git::current_branch(&self.working_dir).await
    }

    async fn cleanup(&self) -> Result<(), WorkOrderError> {
        info!(sandbox_identifier = %self.identifier, "worktree_sandbox_cleanup_started");
        worktree::remove_worktree(&self.config, &self.repository_url, &self.work_order_id).await?;
        info!(sandbox_identifier = %self.identifier, "worktree_sandbox_cleanup_completed");
        Ok(())
    }
}
