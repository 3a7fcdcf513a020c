//! State/filesystem reconciliation.
//!
//! Sandboxes live on disk, work orders live in the state repository, and a
//! crash between the two leaves them disagreeing: a directory nobody's
//! state points at (orphan), or state whose directory is gone (dangling).
//! These helpers detect both and, on request, fix them - orphans get
//! deleted, dangling work orders get driven to `failed`. One stubborn fix
//! never blocks the rest.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info};

use crate::{
    config::Config,
    errors::WorkOrderError,
    models::{SandboxKind, StatusUpdate, WorkOrderStatus},
    state::WorkOrderRepository,
    worktree,
};

#[derive(Debug, Default, Serialize)]
pub struct ReconciliationReport {
    pub orphaned_worktrees: Vec<PathBuf>,
    pub dangling_state: Vec<String>,
    pub fix_applied: bool,
    pub actions_taken: Vec<String>,
}

/// Sandbox directories on disk with no matching `sandbox_identifier` in the
/// state repository.
pub async fn find_orphaned_worktrees(
    config: &Config,
    repo: &dyn WorkOrderRepository,
) -> Result<Vec<PathBuf>, WorkOrderError> {
    if !config.temp_dir.exists() {
        info!(path = %config.temp_dir.display(), "worktree_base_directory_not_found");
        return Ok(Vec::new());
    }

    let known: std::collections::HashSet<String> = repo
        .list(None)
        .await?
        .into_iter()
        .map(|(state, _)| state.sandbox_identifier)
        .collect();

    let entries = std::fs::read_dir(&config.temp_dir)
        .map_err(|e| WorkOrderError::StateRepository(format!("reading temp dir: {e}")))?;
    let mut orphans = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        // Only sandbox directories are candidates; the temp base also holds
        // the repos/ cache and per-order artifact directories.
        if name.starts_with("sandbox-") && !known.contains(&name) {
            orphans.push(path);
        }
    }

    info!(
        count = orphans.len(),
        total_known = known.len(),
        "orphaned_worktrees_found"
    );
    Ok(orphans)
}

/// Work order ids whose expected sandbox directory no longer exists.
pub async fn find_dangling_state(
    config: &Config,
    repo: &dyn WorkOrderRepository,
) -> Result<Vec<String>, WorkOrderError> {
    let mut dangling = Vec::new();
    for (state, metadata) in repo.list(None).await? {
        let expected = match metadata.sandbox_type {
            SandboxKind::Worktree => {
                worktree::worktree_path(config, &state.repository_url, &state.work_order_id)
            }
            _ => config.temp_dir.join(&state.sandbox_identifier),
        };
        if !expected.exists() {
            dangling.push(state.work_order_id);
        }
    }
    info!(count = dangling.len(), "dangling_state_found");
    Ok(dangling)
}

/// Detect both inconsistencies; with `fix` also delete orphans and mark
/// dangling work orders failed.
pub async fn reconcile(
    config: &Config,
    repo: &dyn WorkOrderRepository,
    fix: bool,
) -> Result<ReconciliationReport, WorkOrderError> {
    let orphans = find_orphaned_worktrees(config, repo).await?;
    let dangling = find_dangling_state(config, repo).await?;
    let mut actions = Vec::new();

    if fix {
        for orphan in &orphans {
            match std::fs::remove_dir_all(orphan) {
                Ok(()) => {
                    info!(path = %orphan.display(), "orphaned_worktree_deleted");
                    actions.push(format!("Deleted orphaned worktree: {}", orphan.display()));
                }
                Err(err) => {
                    error!(path = %orphan.display(), error = %err, "orphaned_worktree_delete_failed");
                    actions.push(format!("Failed to delete {}: {err}", orphan.display()));
                }
            }
        }

        for work_order_id in &dangling {
            match repo
                .update_status(
                    work_order_id,
                    WorkOrderStatus::Failed,
                    StatusUpdate::error(
                        "Worktree missing - state/filesystem divergence detected during \
                         reconciliation",
                    ),
                )
                .await
            {
                Ok(()) => {
                    info!(work_order_id = %work_order_id, "dangling_state_updated");
                    actions.push(format!(
                        "Marked work order {work_order_id} as failed (worktree missing)"
                    ));
                }
                Err(err) => {
                    error!(work_order_id = %work_order_id, error = %err, "dangling_state_update_failed");
                    actions.push(format!("Failed to update {work_order_id}: {err}"));
                }
            }
        }
    }

    Ok(ReconciliationReport {
        orphaned_worktrees: orphans,
        dangling_state: dangling,
        fix_applied: fix,
        actions_taken: actions,
    })
}
