//! Ephemeral-clone sandbox: a throwaway `git clone` under the temp base,
//! recursively deleted on cleanup. Simple and network-hungry; the worktree
//! variant is the one meant for heavy concurrent use.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tracing::{info, warn};

use super::{run_in_dir, Sandbox};
use crate::{
    config::Config,
    errors::WorkOrderError,
    git,
    models::CommandOutcome,
    process,
    util,
};

#[derive(Debug)]
pub struct CloneSandbox {
    repository_url: String,
    identifier: String,
    working_dir: PathBuf,
}

impl CloneSandbox {
    pub fn new(config: Arc<Config>, repository_url: String, work_order_id: &str) -> Self {
        let identifier = util::sandbox_identifier(work_order_id);
        let working_dir = config.temp_dir.join(&identifier);
        Self {
            repository_url,
            identifier,
            working_dir,
        }
    }
}

#[async_trait]
impl Sandbox for CloneSandbox {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    async fn setup(&self) -> Result<(), WorkOrderError> {
        info!(sandbox_identifier = %self.identifier, "sandbox_setup_started");
        let parent = self
            .working_dir
            .parent()
            .ok_or_else(|| WorkOrderError::SandboxSetup("working dir has no parent".into()))?;
        std::fs::create_dir_all(parent).map_err(|e| {
            WorkOrderError::SandboxSetup(format!("creating {}: {e}", parent.display()))
        })?;

        let mut cmd = process::command("git", ["clone", &self.repository_url]);
        cmd.arg(&self.working_dir).current_dir(parent);
        let (code, _, stderr) = process::output(cmd)
            .await
            .map_err(|e| WorkOrderError::SandboxSetup(format!("running git clone: {e}")))?;
        if code != 0 {
            return Err(WorkOrderError::SandboxSetup(format!(
                "Failed to clone repository: {stderr}"
            )));
        }
        info!(working_dir = %self.working_dir.display(), "sandbox_setup_completed");
        Ok(())
    }

    async fn execute_command(&self, command: &str, timeout: Duration) -> CommandOutcome {
        run_in_dir(command, &self.working_dir, timeout).await
    }

    async fn git_branch_name(&self) -> Option<String> {
        git::current_branch(&self.working_dir).await
    }

    async fn cleanup(&self) -> Result<(), WorkOrderError> {
        info!(sandbox_identifier = %self.identifier, "sandbox_cleanup_started");
        if !self.working_dir.exists() {
            warn!(working_dir = %self.working_dir.display(), "sandbox_cleanup_skipped");
            return Ok(());
        }
        tokio::fs::remove_dir_all(&self.working_dir)
            .await
            .map_err(|e| {
                WorkOrderError::SandboxSetup(format!(
                    "removing {}: {e}",
                    self.working_dir.display()
                ))
            })?;
        info!(sandbox_identifier = %self.identifier, "sandbox_cleanup_completed");
        Ok(())
    }
}
