//! File-per-id backend: one JSON document at `<dir>/<id>.json` holding
//! `{state, metadata, step_history}`. All operations are serialized by one
//! lock; writes are whole-file rewrites under that lock, so readers never
//! observe a torn document through this repository. (Crash-safety via
//! temp-file-and-rename is a known hardening step, recorded in DESIGN.md.)

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{transition_permitted, WorkOrderRepository};
use crate::{
    errors::WorkOrderError,
    models::{StatusUpdate, StepHistory, WorkOrderMetadata, WorkOrderState, WorkOrderStatus},
};

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    state: WorkOrderState,
    metadata: WorkOrderMetadata,
    step_history: Option<StepHistory>,
}

pub struct FileStateRepository {
    state_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileStateRepository {
    pub fn new(state_dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            state_dir,
            lock: Mutex::new(()),
        })
    }

    fn document_path(&self, work_order_id: &str) -> PathBuf {
        self.state_dir.join(format!("{work_order_id}.json"))
    }

    fn read_document(&self, work_order_id: &str) -> Result<Option<StateDocument>, WorkOrderError> {
        let path = self.document_path(work_order_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| WorkOrderError::StateRepository(format!("reading {}: {e}", path.display())))?;
        let document = serde_json::from_str(&contents)
            .map_err(|e| WorkOrderError::StateRepository(format!("parsing {}: {e}", path.display())))?;
        Ok(Some(document))
    }

    fn write_document(
        &self,
        work_order_id: &str,
        document: &StateDocument,
    ) -> Result<(), WorkOrderError> {
        let path = self.document_path(work_order_id);
        let contents = serde_json::to_vec_pretty(document)
            .map_err(|e| WorkOrderError::StateRepository(format!("serializing {work_order_id}: {e}")))?;
        std::fs::write(&path, contents)
            .map_err(|e| WorkOrderError::StateRepository(format!("writing {}: {e}", path.display())))
    }

    fn parse_file(path: &Path) -> Option<StateDocument> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(document) => Some(document),
            Err(err) => {
                warn!(file = %path.display(), error = %err, "state_file_load_failed");
                None
            }
        }
    }
}

#[async_trait]
impl WorkOrderRepository for FileStateRepository {
    async fn create(
        &self,
        state: WorkOrderState,
        metadata: WorkOrderMetadata,
    ) -> Result<(), WorkOrderError> {
        let _guard = self.lock.lock().await;
        let id = state.work_order_id.clone();
        if self.document_path(&id).exists() {
            return Err(WorkOrderError::StateRepository(format!(
                "work order {id} already exists"
            )));
        }
        self.write_document(
            &id,
            &StateDocument {
                state,
                metadata,
                step_history: None,
            },
        )?;
        info!(work_order_id = %id, "work_order_created");
        Ok(())
    }

    async fn get(
        &self,
        work_order_id: &str,
    ) -> Result<Option<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_document(work_order_id)?
            .map(|doc| (doc.state, doc.metadata)))
    }

    async fn list(
        &self,
        status: Option<WorkOrderStatus>,
    ) -> Result<Vec<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError> {
        let _guard = self.lock.lock().await;
        let entries = std::fs::read_dir(&self.state_dir)
            .map_err(|e| WorkOrderError::StateRepository(format!("listing state dir: {e}")))?;
        let mut results = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            // A malformed document shouldn't hide every other work order.
            if let Some(doc) = Self::parse_file(&path) {
                if status.map_or(true, |s| doc.metadata.status == s) {
                    results.push((doc.state, doc.metadata));
                }
            }
        }
        results.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        Ok(results)
    }

    async fn update_status(
        &self,
        work_order_id: &str,
        status: WorkOrderStatus,
        update: StatusUpdate,
    ) -> Result<(), WorkOrderError> {
        let _guard = self.lock.lock().await;
        let Some(mut doc) = self.read_document(work_order_id)? else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        if !transition_permitted(work_order_id, doc.metadata.status, status) {
            return Ok(());
        }
        doc.metadata.status = status;
        doc.metadata.updated_at = Utc::now();
        update.apply_to(&mut doc.metadata);
        self.write_document(work_order_id, &doc)?;
        info!(work_order_id, status = %status, "work_order_status_updated");
        Ok(())
    }

    async fn update_git_branch(
        &self,
        work_order_id: &str,
        git_branch_name: &str,
    ) -> Result<(), WorkOrderError> {
        let _guard = self.lock.lock().await;
        let Some(mut doc) = self.read_document(work_order_id)? else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        doc.state.git_branch_name = Some(git_branch_name.to_string());
        doc.metadata.updated_at = Utc::now();
        self.write_document(work_order_id, &doc)?;
        info!(work_order_id, git_branch_name, "work_order_git_branch_updated");
        Ok(())
    }

    async fn update_session_id(
        &self,
        work_order_id: &str,
        agent_session_id: &str,
    ) -> Result<(), WorkOrderError> {
        let _guard = self.lock.lock().await;
        let Some(mut doc) = self.read_document(work_order_id)? else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        doc.state.agent_session_id = Some(agent_session_id.to_string());
        doc.metadata.updated_at = Utc::now();
        self.write_document(work_order_id, &doc)?;
        info!(work_order_id, agent_session_id, "work_order_session_id_updated");
        Ok(())
    }

    async fn save_step_history(
        &self,
        work_order_id: &str,
        history: &StepHistory,
    ) -> Result<(), WorkOrderError> {
        let _guard = self.lock.lock().await;
        let Some(mut doc) = self.read_document(work_order_id)? else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        doc.step_history = Some(history.clone());
        self.write_document(work_order_id, &doc)?;
        info!(work_order_id, step_count = history.steps.len(), "step_history_saved");
        Ok(())
    }

    async fn get_step_history(
        &self,
        work_order_id: &str,
    ) -> Result<Option<StepHistory>, WorkOrderError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .read_document(work_order_id)?
            .and_then(|doc| doc.step_history))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::SandboxKind;

    // Round-trip at the JSON level: the on-disk schema is part of the
    // contract (other tooling reads these files).
    #[tokio::test]
    async fn test_document_schema_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path().to_path_buf()).unwrap();
        let state = WorkOrderState::new(
            "wo-12345678".into(),
            "https://github.com/example/repo".into(),
        );
        let metadata = WorkOrderMetadata::new(SandboxKind::Worktree, None);
        repo.create(state.clone(), metadata.clone()).await.unwrap();

        let raw: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("wo-12345678.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(raw["state"]["work_order_id"], "wo-12345678");
        assert_eq!(raw["state"]["sandbox_identifier"], "sandbox-wo-12345678");
        assert_eq!(raw["metadata"]["status"], "pending");
        assert_eq!(raw["metadata"]["sandbox_type"], "worktree");
        assert_eq!(raw["step_history"], serde_json::Value::Null);
        // Timestamps serialize as ISO-8601.
        assert!(raw["metadata"]["created_at"].as_str().unwrap().contains('T'));

        let (got_state, got_metadata) = repo.get("wo-12345678").await.unwrap().unwrap();
        assert_eq!(got_state, state);
        assert_eq!(got_metadata, metadata);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = FileStateRepository::new(dir.path().to_path_buf()).unwrap();
            let state = WorkOrderState::new("wo-feedf00d".into(), "url".into());
            repo.create(state, WorkOrderMetadata::new(SandboxKind::Clone, None))
                .await
                .unwrap();
            repo.update_status(
                "wo-feedf00d",
                WorkOrderStatus::Running,
                StatusUpdate::default(),
            )
            .await
            .unwrap();
        }
        let reopened = FileStateRepository::new(dir.path().to_path_buf()).unwrap();
        let (_, metadata) = reopened.get("wo-feedf00d").await.unwrap().unwrap();
        assert_eq!(metadata.status, WorkOrderStatus::Running);
    }

    #[tokio::test]
    async fn test_list_skips_malformed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileStateRepository::new(dir.path().to_path_buf()).unwrap();
        repo.create(
            WorkOrderState::new("wo-aaaa0000".into(), "url".into()),
            WorkOrderMetadata::new(SandboxKind::Clone, None),
        )
        .await
        .unwrap();
        std::fs::write(dir.path().join("wo-broken.json"), "{not json").unwrap();

        let listed = repo.list(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0.work_order_id, "wo-aaaa0000");
    }
}
