//! Work order state persistence.
//!
//! One minimal async contract with three interchangeable backends, resolved
//! from configuration. Every operation is awaitable even where the backend
//! is synchronous underneath, so callers compose identically regardless of
//! which one is plugged in.

mod file;
mod memory;
mod postgres;

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::{info, warn};

pub use file::FileStateRepository;
pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;

use crate::{
    config::{Config, StateBackend},
    errors::WorkOrderError,
    models::{StatusUpdate, StepHistory, WorkOrderMetadata, WorkOrderState, WorkOrderStatus},
};

#[async_trait]
pub trait WorkOrderRepository: Send + Sync {
    /// Insert a new record. A duplicate id is a programmer error and is
    /// reported as Err, never silently overwritten.
    async fn create(
        &self,
        state: WorkOrderState,
        metadata: WorkOrderMetadata,
    ) -> Result<(), WorkOrderError>;

    async fn get(
        &self,
        work_order_id: &str,
    ) -> Result<Option<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError>;

    /// All records, newest first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<WorkOrderStatus>,
    ) -> Result<Vec<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError>;

    /// Set the status, bump `updated_at` and merge the extra fields. A
    /// missing id logs a warning and returns Ok; an illegal status
    /// transition does the same (re-asserting the current terminal status
    /// is legal and idempotent).
    async fn update_status(
        &self,
        work_order_id: &str,
        status: WorkOrderStatus,
        update: StatusUpdate,
    ) -> Result<(), WorkOrderError>;

    async fn update_git_branch(
        &self,
        work_order_id: &str,
        git_branch_name: &str,
    ) -> Result<(), WorkOrderError>;

    async fn update_session_id(
        &self,
        work_order_id: &str,
        agent_session_id: &str,
    ) -> Result<(), WorkOrderError>;

    /// Persist the whole step vector (fresh save, replacing what was
    /// there).
    async fn save_step_history(
        &self,
        work_order_id: &str,
        history: &StepHistory,
    ) -> Result<(), WorkOrderError>;

    async fn get_step_history(
        &self,
        work_order_id: &str,
    ) -> Result<Option<StepHistory>, WorkOrderError>;
}

/// Shared transition guard: warn-and-skip anything the status graph
/// forbids. Returns whether the update should be applied.
pub(crate) fn transition_permitted(
    work_order_id: &str,
    current: WorkOrderStatus,
    next: WorkOrderStatus,
) -> bool {
    if current.can_advance_to(next) {
        true
    } else {
        warn!(
            work_order_id,
            current = %current,
            requested = %next,
            "work_order_status_transition_rejected"
        );
        false
    }
}

/// Build the configured backend. Postgres credentials were already checked
/// when the config was loaded, so a missing DATABASE_URL fails the process
/// at startup rather than on first call; here we also fail fast if the
/// database is unreachable.
pub async fn create_repository(config: &Config) -> anyhow::Result<Arc<dyn WorkOrderRepository>> {
    match config.state_backend {
        StateBackend::Memory => {
            info!(backend = "memory", "repository_created");
            Ok(Arc::new(InMemoryRepository::new()))
        }
        StateBackend::File => {
            let repo = FileStateRepository::new(config.state_dir.clone())
                .context("initializing file state repository")?;
            info!(backend = "file", state_dir = %config.state_dir.display(), "repository_created");
            Ok(Arc::new(repo))
        }
        StateBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("postgres backend requires DATABASE_URL")?;
            let repo = PostgresRepository::connect(url)
                .await
                .context("connecting to postgres state repository")?;
            info!(backend = "postgres", "repository_created");
            Ok(Arc::new(repo))
        }
    }
}
