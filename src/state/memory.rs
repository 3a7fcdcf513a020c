//! In-memory backend: two maps plus the step histories behind one lock.
//! State is lost on restart, which is fine for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{transition_permitted, WorkOrderRepository};
use crate::{
    errors::WorkOrderError,
    models::{StatusUpdate, StepHistory, WorkOrderMetadata, WorkOrderState, WorkOrderStatus},
};

#[derive(Default)]
struct Inner {
    orders: HashMap<String, (WorkOrderState, WorkOrderMetadata)>,
    histories: HashMap<String, StepHistory>,
}

#[derive(Default)]
pub struct InMemoryRepository {
    inner: Mutex<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkOrderRepository for InMemoryRepository {
    async fn create(
        &self,
        state: WorkOrderState,
        metadata: WorkOrderMetadata,
    ) -> Result<(), WorkOrderError> {
        let mut inner = self.inner.lock().await;
        let id = state.work_order_id.clone();
        if inner.orders.contains_key(&id) {
            return Err(WorkOrderError::StateRepository(format!(
                "work order {id} already exists"
            )));
        }
        inner.orders.insert(id.clone(), (state, metadata));
        info!(work_order_id = %id, "work_order_created");
        Ok(())
    }

    async fn get(
        &self,
        work_order_id: &str,
    ) -> Result<Option<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError> {
        Ok(self.inner.lock().await.orders.get(work_order_id).cloned())
    }

    async fn list(
        &self,
        status: Option<WorkOrderStatus>,
    ) -> Result<Vec<(WorkOrderState, WorkOrderMetadata)>, WorkOrderError> {
        let inner = self.inner.lock().await;
        let mut results: Vec<_> = inner
            .orders
            .values()
            .filter(|(_, metadata)| status.map_or(true, |s| metadata.status == s))
            .cloned()
            .collect();
        results.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        Ok(results)
    }

    async fn update_status(
        &self,
        work_order_id: &str,
        status: WorkOrderStatus,
        update: StatusUpdate,
    ) -> Result<(), WorkOrderError> {
        let mut inner = self.inner.lock().await;
        let Some((_, metadata)) = inner.orders.get_mut(work_order_id) else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        if !transition_permitted(work_order_id, metadata.status, status) {
            return Ok(());
        }
        metadata.status = status;
        metadata.updated_at = Utc::now();
        update.apply_to(metadata);
        info!(work_order_id, status = %status, "work_order_status_updated");
        Ok(())
    }

    async fn update_git_branch(
        &self,
        work_order_id: &str,
        git_branch_name: &str,
    ) -> Result<(), WorkOrderError> {
        let mut inner = self.inner.lock().await;
        let Some((state, metadata)) = inner.orders.get_mut(work_order_id) else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        state.git_branch_name = Some(git_branch_name.to_string());
        metadata.updated_at = Utc::now();
        info!(work_order_id, git_branch_name, "work_order_git_branch_updated");
        Ok(())
    }

    async fn update_session_id(
        &self,
        work_order_id: &str,
        agent_session_id: &str,
    ) -> Result<(), WorkOrderError> {
        let mut inner = self.inner.lock().await;
        let Some((state, metadata)) = inner.orders.get_mut(work_order_id) else {
            warn!(work_order_id, "work_order_not_found_for_update");
            return Ok(());
        };
        state.agent_session_id = Some(agent_session_id.to_string());
        metadata.updated_at = Utc::now();
        info!(work_order_id, agent_session_id, "work_order_session_id_updated");
        Ok(())
    }

    async fn save_step_history(
        &self,
        work_order_id: &str,
        history: &StepHistory,
    ) -> Result<(), WorkOrderError> {
        let mut inner = self.inner.lock().await;
        inner
            .histories
            .insert(work_order_id.to_string(), history.clone());
        info!(work_order_id, step_count = history.steps.len(), "step_history_saved");
        Ok(())
    }

    async fn get_step_history(
        &self,
        work_order_id: &str,
    ) -> Result<Option<StepHistory>, WorkOrderError> {
        Ok(self.inner.lock().await.histories.get(work_order_id).cloned())
    }
}
