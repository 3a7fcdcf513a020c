//! Thin HTTP controller over the orchestration core.
//!
//! Handlers validate, call into the core, and map errors onto status
//! codes; no business logic lives here. Work order creation schedules the
//! workflow as a background task and returns immediately - nothing in this
//! layer ever waits on a running workflow.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::Config,
    errors::WorkOrderError,
    git,
    github::{GitHubClient, VerificationOutcome},
    logbuf::LogBuffer,
    models::{
        GitProgressSnapshot, SandboxKind, StepHistory, WorkOrder, WorkOrderMetadata,
        WorkOrderState, WorkOrderStatus, WorkflowStep,
    },
    registry::TaskRegistry,
    sse::{self, StreamFilter},
    state::WorkOrderRepository,
    util,
    workflow::{WorkflowOrchestrator, WorkflowRequest},
    worktree,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<dyn WorkOrderRepository>,
    pub registry: Arc<TaskRegistry>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub github: Arc<GitHubClient>,
    pub log_buffer: Arc<LogBuffer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/agent-work-orders",
            post(create_work_order).get(list_work_orders),
        )
        .route("/agent-work-orders/:id", get(get_work_order))
        .route("/agent-work-orders/:id/steps", get(get_step_history))
        .route("/agent-work-orders/:id/git-progress", get(get_git_progress))
        .route("/agent-work-orders/:id/logs/stream", get(stream_logs))
        .route("/github/verify-repository", post(verify_repository))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(work_order_id: &str) -> Self {
        Self(
            StatusCode::NOT_FOUND,
            format!("work order {work_order_id} not found"),
        )
    }

    fn invalid(detail: impl Into<String>) -> Self {
        Self(StatusCode::UNPROCESSABLE_ENTITY, detail.into())
    }
}

impl From<WorkOrderError> for ApiError {
    fn from(err: WorkOrderError) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "detail": self.1 }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkOrderRequest {
    pub repository_url: String,
    #[serde(default = "default_sandbox_type")]
    pub sandbox_type: SandboxKind,
    pub user_request: String,
    #[serde(default)]
    pub selected_commands: Option<Vec<String>>,
    #[serde(default)]
    pub github_issue_number: Option<String>,
}

fn default_sandbox_type() -> SandboxKind {
    SandboxKind::Worktree
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWorkOrderResponse {
    pub work_order_id: String,
    pub status: WorkOrderStatus,
    pub message: String,
}

async fn create_work_order(
    State(app): State<AppState>,
    Json(request): Json<CreateWorkOrderRequest>,
) -> Result<(StatusCode, Json<CreateWorkOrderResponse>), ApiError> {
    if request.repository_url.trim().is_empty() {
        return Err(ApiError::invalid("repository_url must not be empty"));
    }
    if request.user_request.trim().is_empty() {
        return Err(ApiError::invalid("user_request must not be empty"));
    }
    if let Some(commands) = &request.selected_commands {
        if commands.is_empty() {
            return Err(ApiError::invalid("selected_commands must not be empty"));
        }
        for command in commands {
            if WorkflowStep::from_key(command).is_none() {
                return Err(ApiError::invalid(format!("Invalid command: {command}")));
            }
        }
    }

    let work_order_id = util::new_work_order_id();
    let state = WorkOrderState::new(work_order_id.clone(), request.repository_url.clone());
    let metadata = WorkOrderMetadata::new(
        request.sandbox_type,
        request.github_issue_number.clone(),
    );
    app.repository.create(state, metadata).await?;

    app.registry.spawn_workflow(
        app.orchestrator.clone(),
        app.repository.clone(),
        WorkflowRequest {
            work_order_id: work_order_id.clone(),
            repository_url: request.repository_url,
            sandbox_type: request.sandbox_type,
            user_request: request.user_request,
            selected_commands: request.selected_commands,
            github_issue_number: request.github_issue_number,
        },
    );

    info!(work_order_id = %work_order_id, "agent_work_order_created");
    Ok((
        StatusCode::CREATED,
        Json(CreateWorkOrderResponse {
            work_order_id,
            status: WorkOrderStatus::Pending,
            message: "Work order created and workflow execution started".to_string(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

async fn list_work_orders(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<WorkOrder>>, ApiError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            WorkOrderStatus::parse(raw)
                .ok_or_else(|| ApiError::invalid(format!("invalid status filter: {raw}")))?,
        ),
    };
    let records = app.repository.list(status).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|(state, metadata)| WorkOrder::assemble(state, metadata))
            .collect(),
    ))
}

async fn get_work_order(
    State(app): State<AppState>,
    Path(work_order_id): Path<String>,
) -> Result<Json<WorkOrder>, ApiError> {
    let (state, metadata) = app
        .repository
        .get(&work_order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&work_order_id))?;
    Ok(Json(WorkOrder::assemble(state, metadata)))
}

async fn get_step_history(
    State(app): State<AppState>,
    Path(work_order_id): Path<String>,
) -> Result<Json<StepHistory>, ApiError> {
    if app.repository.get(&work_order_id).await?.is_none() {
        return Err(ApiError::not_found(&work_order_id));
    }
    let history = app
        .repository
        .get_step_history(&work_order_id)
        .await?
        .unwrap_or_else(|| StepHistory::new(&work_order_id));
    Ok(Json(history))
}

async fn get_git_progress(
    State(app): State<AppState>,
    Path(work_order_id): Path<String>,
) -> Result<Json<GitProgressSnapshot>, ApiError> {
    let (state, metadata) = app
        .repository
        .get(&work_order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(&work_order_id))?;

    let working_dir = match metadata.sandbox_type {
        SandboxKind::Worktree => {
            worktree::worktree_path(&app.config, &state.repository_url, &state.work_order_id)
        }
        _ => app.config.temp_dir.join(&state.sandbox_identifier),
    };

    let mut snapshot = GitProgressSnapshot {
        work_order_id: work_order_id.clone(),
        git_commit_count: metadata.git_commit_count,
        git_files_changed: metadata.git_files_changed,
        latest_commit_message: None,
        git_branch_name: state.git_branch_name.clone(),
    };
    // Live numbers while the sandbox still exists; the persisted metadata
    // keeps serving after cleanup.
    if let Some(branch) = &state.git_branch_name {
        if working_dir.exists() {
            snapshot.git_commit_count = git::commit_count(branch, &working_dir, "main").await;
            snapshot.git_files_changed = git::files_changed(branch, &working_dir, "main").await;
            snapshot.latest_commit_message =
                git::latest_commit_message(branch, &working_dir).await;
        }
    }
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    level: Option<String>,
    step: Option<String>,
    since: Option<String>,
}

async fn stream_logs(
    State(app): State<AppState>,
    Path(work_order_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    sse::sse_response(
        app.log_buffer.clone(),
        work_order_id,
        StreamFilter {
            level: query.level,
            step: query.step,
            since: query.since,
        },
    )
}

#[derive(Debug, Deserialize)]
struct VerifyRepositoryRequest {
    repository_url: String,
}

async fn verify_repository(
    State(app): State<AppState>,
    Json(request): Json<VerifyRepositoryRequest>,
) -> Json<VerificationOutcome> {
    Json(app.github.verify_repository(&request.repository_url).await)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
