use std::{path::Path, time::Duration};

use tracing::debug;

use crate::process::{self, Communicated};

// Inspection helpers are advisory: they feed progress displays and
// completion stats, so a wedged or missing git must never take the workflow
// down with it.
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

async fn inspect(repo: &Path, args: &[&str]) -> Option<String> {
    let mut cmd = process::command("git", args);
    cmd.current_dir(repo);
    match process::communicate(cmd, None, Some(INSPECT_TIMEOUT)).await {
        Ok(Communicated::Finished {
            exit_code: 0,
            stdout,
            ..
        }) => Some(stdout),
        Ok(Communicated::Finished {
            exit_code, stderr, ..
        }) => {
            debug!(?args, exit_code, stderr = %stderr, "git_inspection_failed");
            None
        }
        Ok(Communicated::TimedOut) => {
            debug!(?args, "git_inspection_timed_out");
            None
        }
        Err(err) => {
            debug!(?args, error = %err, "git_inspection_error");
            None
        }
    }
}

/// Commits added on `branch` relative to `origin/<base>`. 0 on any failure.
pub async fn commit_count(branch: &str, repo: &Path, base: &str) -> u32 {
    let range = format!("origin/{base}..{branch}");
    match inspect(repo, &["rev-list", "--count", &range]).await {
        Some(stdout) => stdout.trim().parse().unwrap_or(0),
        None => 0,
    }
}

/// Files touched on `branch` relative to the merge base with `base`. 0 on
/// any failure.
pub async fn files_changed(branch: &str, repo: &Path, base: &str) -> u32 {
    let range = format!("{base}...{branch}");
    match inspect(repo, &["diff", "--name-only", &range]).await {
        Some(stdout) => stdout.lines().filter(|l| !l.trim().is_empty()).count() as u32,
        None => 0,
    }
}

/// Most recent commit message on `branch`, or None.
pub async fn latest_commit_message(branch: &str, repo: &Path) -> Option<String> {
    let stdout = inspect(repo, &["log", "-1", "--pretty=%B", branch]).await?;
    let message = stdout.trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

/// The branch currently checked out in `repo`, or None (detached HEAD,
/// not a repo, ...).
pub async fn current_branch(repo: &Path) -> Option<String> {
    let stdout = inspect(repo, &["branch", "--show-current"]).await?;
    let branch = stdout.trim();
    if branch.is_empty() {
        None
    } else {
        Some(branch.to_string())
    }
}
