//! Postgres backend.
//!
//! Hybrid schema: the frequently queried fields are real columns, the rest
//! of the metadata lives in a JSONB blob. Step history is one row per step
//! with `step_order` for ordering and a cascade-deleting foreign key, saved
//! with the delete-then-bulk-insert fresh-save pattern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row as _};
use tracing::{info, warn};

use super::{transition_permitted, WorkOrderRepository};
use crate::{
    errors::WorkOrderError,
    models::{
        SandboxKind, StatusUpdate, StepHistory, StepResult, WorkOrderMetadata, WorkOrderState,
        WorkOrderStatus, WorkflowStep,
    },
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS work_orders (
    work_order_id       TEXT PRIMARY KEY,
    repository_url      TEXT NOT NULL,
    sandbox_identifier  TEXT NOT NULL,
    git_branch_name     TEXT,
    agent_session_id    TEXT,
    status              TEXT NOT NULL,
    metadata            JSONB NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS work_order_steps (
    id                  BIGSERIAL PRIMARY KEY,
    work_order_id       TEXT NOT NULL REFERENCES work_orders(work_order_id) ON DELETE CASCADE,
    step                TEXT NOT NULL,
    agent_name          TEXT NOT NULL,
    success             BOOLEAN NOT NULL,
    output              TEXT,
    error_message       TEXT,
    duration_seconds    DOUBLE PRECISION NOT NULL,
    session_id          TEXT,
    executed_at         TIMESTAMPTZ NOT NULL,
    step_order          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS work_order_steps_order
    ON work_order_steps (work_order_id, step_order);
"#;

// The slice of metadata that rides in the JSONB column; status and the
// timestamps are columns of their own.
#[derive(Debug, Serialize, Deserialize)]
struct MetadataBlob {
    sandbox_type: SandboxKind,
    #[serde(default)]
    github_issue_number: Option<String>,
    #[serde(default)]
    github_pull_request_url: Option<String>,
    #[serde(default)]
    git_commit_count: u32,
    #[serde(default)]
    git_files_changed: u32,
    #[serde(default)]
    error_message: Option<String>,
}

impl MetadataBlob {
    fn split(metadata: &WorkOrderMetadata) -> Self {
        Self {
            sandbox_type: metadata.sandbox_type,
            github_issue_number: metadata.github_issue_number.clone(),
            github_pull_request_url: metadata.github_pull_request_url.clone(),
            git_commit_count: metadata.git_commit_count,
            git_files_changed: metadata.git_files_changed,
            error_message: metadata.error_message.clone(),
        }
    }

    fn merge(
        self,
        status: WorkOrderStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> WorkOrderMetadata {
        WorkOrderMetadata {
            sandbox_type: self.sandbox_type,
            status,
            created_at,
            updated_at,
            github_issue_number: self.github_issue_number,
            github_pull_request_url: self.github_pull_request_url,
            git_commit_count: self.git_commit_count,
            git_files_changed: self.git_files_changed,
            error_message: self.error_message,
        }
    }
}

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect and make sure the schema exists. Connection failure here is
    /// deliberate startup failure, per the fail-at-boot contract.
    pub async fn connect(database_url: &str) -> Result<Self, WorkOrderError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), WorkOrderError> {
        let mut tx = self.pool.begin().await?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn row_to_record(
        row: &sqlx::postgres::PgRow,
    ) -> Result<(WorkOrderState, WorkOrderMetadata), WorkOrderError> {
        let state = WorkOrderState {
            work_order_id: row.try_get("work_order_id")?,
            repository_url: row.try_get("repository_url")?,
            sandbox_identifier: row.try_get("sandbox_identifier")?,
            git_branch_name: row.try_get("git_branch_name")?,
            agent_session_id: row.try_get("agent_session_id")?,
        };
        let status_raw: String = row.try_get("status")?;
        let status = WorkOrderStatus::parse(&status_raw).ok_or_else(|| {
            WorkOrderError::StateRepository(format!("unknown status {status_raw:?} in database"))
        })?;
        let blob_value: serde_json::Value = row.try_get("metadata")?;
        let blob: MetadataBlob = serde_json::from_value(blob_value)
            .map_err(|e| WorkOrderError::StateRepository(format!("decoding metadata blob: {e}")))?;
        let metadata = blob.merge(
            status,
            row.try_get("created_at")?,
            row.try_get("updated_at")?,
        );
        Ok((state, metadata))
    }

    fn row_to_step(row: &sqlx::postgres::PgRow) -> Result<StepResult, WorkOrderError> {
        let step_raw: String = row.try_get("step")?;
        let step = WorkflowStep::from_key(&step_raw).ok_or_else(|| {
            WorkOrderError::StateRepository(format!("unknown step {step_raw:?} in database"))
        })?;
        Ok(StepResult {
            step,
            agent_name: row.try_get("agent_name")?,
            success: row.try_get("success")?,
            output: row.try_get("output")?,
            error_message: row.try_get("error_message")?,
            duration_seconds: row.try_get("duration_seconds")?,
            session_id: row.try_get("session_id")?,
            timestamp: row.try_get("executed_at")?,
        })
    }
}

#[async_trait]
impl WorkOrderRepository for PostgresRepository {
    async fn create(
        &self,
        state: WorkOrderState,
        metadata: WorkOrderMetadata,
    ) -> Result<(), WorkOrderError> {
        let blob = serde_json::to_value(MetadataBlob::split(&metadata))
            .map_err(|e| WorkOrderError::StateRepository(e.to_string()))?;
        sqlx::query(
            "INSERT INTO work_orders \
             (work_order_id, repository_url, sandbox_identifier, git_branch_name, \
              agent_session_id, status, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&state.work_order_id)
        .bind(&state.repository_url)
        .bind(&state.sandbox_identifier)
        .bind(&state.git_branch_name)
        .bind(&state.agent_session_id)
        .bind(metadata.status.as_str())
        .bind(&blob)
        .bind(metadata.created_at)
        .bind(metadata.updated_at)
        .execute(&self.pool)
        .await?;
        info!(work_order_id = %state.work_order_id, "work_order_created");
        Ok(())
    }

    async fn get(
        &self,
        work_order_id: &str,
    ) -> Result<Option<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError> {
        let row = sqlx::query("SELECT * FROM work_orders WHERE work_order_id = $1")
            .bind(work_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn list(
        &self,
        status: Option<WorkOrderStatus>,
    ) -> Result<Vec<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM work_orders WHERE status = $1 ORDER BY created_at DESC",
                )
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM work_orders ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn update_status(
        &self,
        work_order_id: &str,
        status: WorkOrderStatus,
        update: StatusUpdate,
    ) -> Result<(), WorkOrderError> {
        // Row lock for the read-guard-write sequence; concurrent updates to
        // one record serialize here.
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT status, metadata FROM work_orders WHERE work_order_id = $1 FOR UPDATE",
        )
        .bind(work_order_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };

        let current_raw: String = row.try_get("status")?;
        let current = WorkOrderStatus::parse(&current_raw).ok_or_else(|| {
            WorkOrderError::StateRepository(format!("unknown status {current_raw:?} in database"))
        })?;
        if !transition_permitted(work_order_id, current, status) {
            return Ok(());
        }

        let blob_value: serde_json::Value = row.try_get("metadata")?;
        let mut blob: MetadataBlob = serde_json::from_value(blob_value)
            .map_err(|e| WorkOrderError::StateRepository(format!("decoding metadata blob: {e}")))?;
        if let Some(url) = &update.github_pull_request_url {
            blob.github_pull_request_url = Some(url.clone());
        }
        if let Some(count) = update.git_commit_count {
            blob.git_commit_count = count;
        }
        if let Some(count) = update.git_files_changed {
            blob.git_files_changed = count;
        }
        if let Some(message) = &update.error_message {
            blob.error_message = Some(message.clone());
        }
        let blob = serde_json::to_value(&blob)
            .map_err(|e| WorkOrderError::StateRepository(e.to_string()))?;

        sqlx::query(
            "UPDATE work_orders SET status = $2, metadata = $3, updated_at = $4 \
             WHERE work_order_id = $1",
        )
        .bind(work_order_id)
        .bind(status.as_str())
        .bind(&blob)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        info!(work_order_id, status = %status, "work_order_status_updated");
        Ok(())
    }

    async fn update_git_branch(
        &self,
        work_order_id: &str,
        git_branch_name: &str,
    ) -> Result<(), WorkOrderError> {
        let result = sqlx::query(
            "UPDATE work_orders SET git_branch_name = $2, updated_at = $3 \
             WHERE work_order_id = $1",
        )
        .bind(work_order_id)
        .bind(git_branch_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(work_order_id, "work_order_not_found_for_update");
        } else {
            info!(work_order_id, git_branch_name, "work_order_git_branch_updated");
        }
        Ok(())
    }

    async fn update_session_id(
        &self,
        work_order_id: &str,
        agent_session_id: &str,
    ) -> Result<(), WorkOrderError> {
        let result = sqlx::query(
            "UPDATE work_orders SET agent_session_id = $2, updated_at = $3 \
             WHERE work_order_id = $1",
        )
        .bind(work_order_id)
        .bind(agent_session_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            warn!(work_order_id, "work_order_not_found_for_update");
        } else {
            info!(work_order_id, agent_session_id, "work_order_session_id_updated");
        }
        Ok(())
    }

    async fn save_step_history(
        &self,
        work_order_id: &str,
        history: &StepHistory,
    ) -> Result<(), WorkOrderError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM work_order_steps WHERE work_order_id = $1")
            .bind(work_order_id)
            .execute(&mut *tx)
            .await?;
        for (order, step) in history.steps.iter().enumerate() {
            sqlx::query(
                "INSERT INTO work_order_steps \
                 (work_order_id, step, agent_name, success, output, error_message, \
                  duration_seconds, session_id, executed_at, step_order) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(work_order_id)
            .bind(step.step.as_str())
            .bind(&step.agent_name)
            .bind(step.success)
            .bind(&step.output)
            .bind(&step.error_message)
            .bind(step.duration_seconds)
            .bind(&step.session_id)
            .bind(step.timestamp)
            .bind(order as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(work_order_id, step_count = history.steps.len(), "step_history_saved");
        Ok(())
    }

    async fn get_step_history(
        &self,
        work_order_id: &str,
    ) -> Result<Option<StepHistory>, WorkOrderError> {
        let rows = sqlx::query(
            "SELECT * FROM work_order_steps WHERE work_order_id = $1 ORDER BY step_order",
        )
        .bind(work_order_id)
        .fetch_all(&self.pool)
        .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let steps = rows
            .iter()
            .map(Self::row_to_step)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(StepHistory {
            work_order_id: work_order_id.to_string(),
            steps,
        }))
    }
}
