//! Two-tier checkout layout under the temp base:
//!
//! ```text
//! <temp>/repos/<repo_hash>/main/              cached base clone per URL
//! <temp>/repos/<repo_hash>/trees/<wo-id>/     per-work-order worktree
//! ```
//!
//! The base clone is long-lived so concurrent work orders share one object
//! database and skip the network clone; worktrees partition the filesystem
//! per work order.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::{
    config::Config,
    errors::WorkOrderError,
    models::WorkOrderState,
    process,
    util::repo_hash,
};

pub fn repo_cache_dir(config: &Config, repository_url: &str) -> PathBuf {
    config
        .temp_dir
        .join("repos")
        .join(repo_hash(repository_url))
}

pub fn base_repo_path(config: &Config, repository_url: &str) -> PathBuf {
    repo_cache_dir(config, repository_url).join("main")
}

pub fn worktree_path(config: &Config, repository_url: &str, work_order_id: &str) -> PathBuf {
    repo_cache_dir(config, repository_url)
        .join("trees")
        .join(work_order_id)
}

async fn git_in(dir: &Path, args: &[&str]) -> Result<(i32, String, String), WorkOrderError> {
    let mut cmd = process::command("git", args);
    cmd.current_dir(dir);
    process::output(cmd)
        .await
        .map_err(|e| WorkOrderError::SandboxSetup(format!("running git {args:?}: {e}")))
}

/// Make sure the cached base clone for `repository_url` exists, fetching the
/// latest refs when it already does. Fetch failures are logged but not
/// fatal; the clone still has usable (if stale) refs.
pub async fn ensure_base_repository(
    config: &Config,
    repository_url: &str,
) -> Result<PathBuf, WorkOrderError> {
    let base = base_repo_path(config, repository_url);

    if base.exists() {
        let (code, _, stderr) = git_in(&base, &["fetch", "origin"]).await?;
        if code != 0 {
            warn!(stderr = %stderr, "base_repository_fetch_failed");
        }
        return Ok(base);
    }

    let parent = base
        .parent()
        .ok_or_else(|| WorkOrderError::SandboxSetup("base repo path has no parent".into()))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| WorkOrderError::SandboxSetup(format!("creating {}: {e}", parent.display())))?;

    info!(repository_url, path = %base.display(), "base_repository_clone_started");
    let mut cmd = process::command("git", ["clone", repository_url]);
    cmd.arg(&base).current_dir(parent);
    let (code, _, stderr) = process::output(cmd)
        .await
        .map_err(|e| WorkOrderError::SandboxSetup(format!("running git clone: {e}")))?;
    if code != 0 {
        return Err(WorkOrderError::SandboxSetup(format!(
            "Failed to clone repository: {stderr}"
        )));
    }
    info!(path = %base.display(), "base_repository_clone_completed");
    Ok(base)
}

/// Create the work order's worktree, branched off origin/main.
///
/// Idempotent: if the worktree directory is already there (say a retried
/// setup), it is returned as-is. If the branch already exists the add is
/// retried without `-b` so we attach to it instead.
pub async fn create_worktree(
    config: &Config,
    repository_url: &str,
    work_order_id: &str,
    branch_name: &str,
) -> Result<PathBuf, WorkOrderError> {
    let base = ensure_base_repository(config, repository_url).await?;
    let path = worktree_path(config, repository_url, work_order_id);

    if path.exists() {
        warn!(path = %path.display(), "worktree_already_exists");
        return Ok(path);
    }

    let parent = path
        .parent()
        .ok_or_else(|| WorkOrderError::SandboxSetup("worktree path has no parent".into()))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| WorkOrderError::SandboxSetup(format!("creating {}: {e}", parent.display())))?;

    let path_str = path.display().to_string();
    let (code, _, stderr) = git_in(
        &base,
        &["worktree", "add", "-b", branch_name, &path_str, "origin/main"],
    )
    .await?;
    if code != 0 {
        if stderr.contains("already exists") {
            let (code, _, stderr) =
                git_in(&base, &["worktree", "add", &path_str, branch_name]).await?;
            if code != 0 {
                return Err(WorkOrderError::SandboxSetup(format!(
                    "Failed to create worktree: {stderr}"
                )));
            }
        } else {
            return Err(WorkOrderError::SandboxSetup(format!(
                "Failed to create worktree: {stderr}"
            )));
        }
    }

    info!(path = %path.display(), branch_name, "worktree_created");
    Ok(path)
}

/// Remove the work order's worktree. Falls back to a plain recursive delete
/// when git refuses (or the base clone is gone); a missing worktree is not
/// an error.
pub async fn remove_worktree(
    config: &Config,
    repository_url: &str,
    work_order_id: &str,
) -> Result<(), WorkOrderError> {
    let base = base_repo_path(config, repository_url);
    let path = worktree_path(config, repository_url, work_order_id);
    let path_str = path.display().to_string();

    if base.exists() {
        let (code, _, stderr) = git_in(&base, &["worktree", "remove", &path_str, "--force"]).await?;
        if code != 0 && path.exists() {
            warn!(stderr = %stderr, "worktree_git_removal_failed_falling_back");
            tokio::fs::remove_dir_all(&path).await.map_err(|e| {
                WorkOrderError::SandboxSetup(format!(
                    "Failed to remove worktree {path_str}: git said {stderr:?}, manual delete: {e}"
                ))
            })?;
        }
    } else if path.exists() {
        tokio::fs::remove_dir_all(&path).await.map_err(|e| {
            WorkOrderError::SandboxSetup(format!("Failed to remove worktree {path_str}: {e}"))
        })?;
    }

    info!(path = %path.display(), "worktree_removed");
    Ok(())
}

/// Three-way consistency check: the state names a worktree, the directory
/// exists, and the base repo's git actually tracks it. Returns the first
/// violated condition as a human-readable reason.
pub async fn validate_worktree(
    config: &Config,
    state: &WorkOrderState,
) -> Result<(), String> {
    if state.sandbox_identifier.is_empty() {
        return Err("no sandbox identifier in state".to_string());
    }
    let path = worktree_path(config, &state.repository_url, &state.work_order_id);
    if !path.exists() {
        return Err(format!("worktree directory not found: {}", path.display()));
    }
    let base = base_repo_path(config, &state.repository_url);
    if !base.exists() {
        return Err(format!("base repository not found: {}", base.display()));
    }
    match git_in(&base, &["worktree", "list"]).await {
        Ok((0, stdout, _)) if stdout.contains(&path.display().to_string()) => Ok(()),
        Ok((0, _, _)) => Err("worktree not registered with git".to_string()),
        Ok((code, _, stderr)) => Err(format!("git worktree list failed with {code}: {stderr}")),
        Err(err) => Err(err.to_string()),
    }
}
