//! The workflow orchestrator: runs one work order's selected commands
//! strictly in sequence inside its sandbox, persisting step history after
//! every step and routing every failure through the `failed` terminal
//! status. Cleanup of the sandbox is guaranteed on every exit path.

use std::{
    sync::Arc,
    time::Instant,
};

use tracing::{error, info, info_span, warn, Instrument as _};

use crate::{
    commands::CommandLoader,
    config::Config,
    errors::WorkOrderError,
    executor::CliExecutor,
    git,
    models::{
        SandboxKind, StatusUpdate, StepHistory, WorkOrderStatus, WorkflowStep,
        DEFAULT_STEP_SEQUENCE,
    },
    sandbox::{self, Sandbox},
    state::WorkOrderRepository,
    steps::{self, StepContext},
    util::ResultExt as _,
};

/// Everything `execute_workflow` needs to know about one run.
#[derive(Debug, Clone)]
pub struct WorkflowRequest {
    pub work_order_id: String,
    pub repository_url: String,
    pub sandbox_type: SandboxKind,
    pub user_request: String,
    /// None means the default sequence.
    pub selected_commands: Option<Vec<String>>,
    pub github_issue_number: Option<String>,
}

pub struct WorkflowOrchestrator {
    config: Arc<Config>,
    executor: CliExecutor,
    command_loader: CommandLoader,
    state: Arc<dyn WorkOrderRepository>,
}

impl WorkflowOrchestrator {
    pub fn new(config: Arc<Config>, state: Arc<dyn WorkOrderRepository>) -> Self {
        Self {
            executor: CliExecutor::new(config.clone()),
            command_loader: CommandLoader::new(config.commands_dir.clone()),
            config,
            state,
        }
    }

    /// Run the work order to its terminal status.
    ///
    /// Workflow-level failures (step failed, unknown command, sandbox setup)
    /// are absorbed here: the status is driven to `failed` and Ok is
    /// returned. Err means the failure escaped this orchestrator's own
    /// handling - the caller's wrapper is the next line of defense.
    pub async fn execute_workflow(&self, request: WorkflowRequest) -> Result<(), WorkOrderError> {
        let span = info_span!("workflow", work_order_id = %request.work_order_id);
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: WorkflowRequest) -> Result<(), WorkOrderError> {
        let started = Instant::now();
        let commands = request.selected_commands.clone().unwrap_or_else(|| {
            DEFAULT_STEP_SEQUENCE
                .iter()
                .map(|s| s.as_str().to_string())
                .collect()
        });

        info!(
            total_steps = commands.len(),
            repository_url = %request.repository_url,
            sandbox_type = %request.sandbox_type,
            "workflow_started"
        );

        let mut history = StepHistory::new(&request.work_order_id);
        let mut sandbox: Option<Box<dyn Sandbox>> = None;

        let outcome = self
            .drive(&request, &commands, &mut history, &mut sandbox)
            .await;

        let result = match outcome {
            Ok(()) => {
                info!(
                    total_steps = history.steps.len(),
                    total_duration_seconds = started.elapsed().as_secs_f64(),
                    "workflow_completed"
                );
                Ok(())
            }
            Err(err) => self.handle_failure(&request, &history, err, started).await,
        };

        // Cleanup runs on every path and never propagates: a failed teardown
        // must not shadow the workflow's own outcome.
        if let Some(sandbox) = sandbox {
            if let Err(cleanup_err) = sandbox.cleanup().await {
                error!(error = %cleanup_err, "sandbox_cleanup_failed");
            }
        }

        result
    }

    async fn handle_failure(
        &self,
        request: &WorkflowRequest,
        history: &StepHistory,
        err: WorkOrderError,
        started: Instant,
    ) -> Result<(), WorkOrderError> {
        error!(
            error = %err,
            completed_steps = history.steps.len(),
            total_duration_seconds = started.elapsed().as_secs_f64(),
            "workflow_failed"
        );

        // Save the partial history even on failure; the incremental save in
        // the step loop normally got there first, this is the safety copy.
        self.state
            .save_step_history(&request.work_order_id, history)
            .await
            .or_log_error("saving step history in failure handler");

        // If even recording the failure fails, that's beyond what this
        // layer can absorb.
        self.state
            .update_status(
                &request.work_order_id,
                WorkOrderStatus::Failed,
                StatusUpdate::error(err.to_string()),
            )
            .await?;
        Ok(())
    }

    async fn drive(
        &self,
        request: &WorkflowRequest,
        commands: &[String],
        history: &mut StepHistory,
        sandbox_slot: &mut Option<Box<dyn Sandbox>>,
    ) -> Result<(), WorkOrderError> {
        let id = &request.work_order_id;
        let total_steps = commands.len();
        let started = Instant::now();

        self.state
            .update_status(id, WorkOrderStatus::Running, StatusUpdate::default())
            .await?;

        info!(repository_url = %request.repository_url, "sandbox_setup_started");
        let sandbox = sandbox_slot.insert(sandbox::create_sandbox(
            self.config.clone(),
            request.sandbox_type,
            &request.repository_url,
            id,
        )?);
        sandbox.setup().await?;
        info!(
            sandbox_identifier = sandbox.identifier(),
            working_dir = %sandbox.working_dir().display(),
            "sandbox_setup_completed"
        );

        let mut context = StepContext::new();
        context.insert("user_request".to_string(), request.user_request.clone());
        if let Some(issue) = &request.github_issue_number {
            context.insert("github_issue_number".to_string(), issue.clone());
        }

        for (index, command_name) in commands.iter().enumerate() {
            let step = WorkflowStep::from_key(command_name).ok_or_else(|| {
                WorkOrderError::WorkflowExecution(format!("Unknown command: {command_name}"))
            })?;

            let step_number = index + 1;
            info!(
                step = %step,
                step_number,
                total_steps,
                progress = %format!("{step_number}/{total_steps}"),
                progress_pct = (step_number * 100 / total_steps) as u64,
                elapsed_seconds = started.elapsed().as_secs(),
                "step_started"
            );

            let result = steps::run_step(
                step,
                &self.executor,
                &self.command_loader,
                id,
                sandbox.working_dir(),
                &context,
            )
            .await;

            // Persist after every step so an interrupted run leaves an
            // accurate trail.
            history.steps.push(result.clone());
            self.state.save_step_history(id, history).await?;

            info!(
                step = %step,
                step_number,
                total_steps,
                success = result.success,
                duration_seconds = result.duration_seconds,
                "step_completed"
            );

            if let Some(session_id) = &result.session_id {
                // Track the most recent CLI session observed; advisory, so
                // a persistence hiccup here doesn't fail the step.
                self.state
                    .update_session_id(id, session_id)
                    .await
                    .or_log_error("recording agent session id");
            }

            if !result.success {
                let message = result
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "step failed".to_string());
                self.state
                    .update_status(id, WorkOrderStatus::Failed, StatusUpdate::error(message.as_str()))
                    .await
                    .or_log_error("marking work order failed");
                return Err(WorkOrderError::WorkflowExecution(format!(
                    "Command '{command_name}' failed: {message}"
                )));
            }

            let output = result.output.clone().unwrap_or_default();
            match step {
                WorkflowStep::CreateBranch => {
                    self.state.update_git_branch(id, &output).await?;
                }
                WorkflowStep::CreatePr => {
                    context.insert("github_pull_request_url".to_string(), output.clone());
                }
                _ => {}
            }
            context.insert(command_name.clone(), output);
        }

        // Terminal bookkeeping: derived git stats plus the PR URL when one
        // was opened.
        let mut update = StatusUpdate {
            github_pull_request_url: context.get("github_pull_request_url").cloned(),
            ..StatusUpdate::default()
        };
        if let Some(branch) = context.get("create-branch") {
            let working_dir = sandbox.working_dir();
            update.git_commit_count = Some(git::commit_count(branch, working_dir, "main").await);
            update.git_files_changed = Some(git::files_changed(branch, working_dir, "main").await);
        } else {
            warn!("git_stats_skipped_no_branch");
        }

        self.state
            .update_status(id, WorkOrderStatus::Completed, update)
            .await?;
        self.state.save_step_history(id, history).await?;
        Ok(())
    }
}
