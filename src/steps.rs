//! One function per workflow step.
//!
//! Every step is the same shape: resolve the command file, build the CLI
//! invocation with arguments pulled from the shared context, run it, and
//! fold the outcome into a [`StepResult`]. Steps never propagate errors -
//! anything that goes wrong inside the step body (missing command file,
//! missing required context, executor trouble) becomes a failed result so
//! the orchestrator has exactly one failure path.

use std::{collections::HashMap, path::Path, time::Instant};

use tracing::error;

use crate::{
    commands::CommandLoader,
    errors::WorkOrderError,
    executor::CliExecutor,
    models::{StepResult, WorkflowStep},
};

// Human-facing agent labels shown in step history.
pub const BRANCH_CREATOR: &str = "BranchCreator";
pub const PLANNER: &str = "Planner";
pub const IMPLEMENTOR: &str = "Implementor";
pub const COMMITTER: &str = "Committer";
pub const PR_CREATOR: &str = "PrCreator";
pub const REVIEWER: &str = "Reviewer";

/// Step outputs keyed by step name, plus the initial `user_request` and
/// `github_issue_number`. Carried forward across the whole run, never
/// cleared between steps.
pub type StepContext = HashMap<String, String>;

pub fn agent_name(step: WorkflowStep) -> &'static str {
    match step {
        WorkflowStep::CreateBranch => BRANCH_CREATOR,
        WorkflowStep::Planning => PLANNER,
        WorkflowStep::Execute => IMPLEMENTOR,
        WorkflowStep::Commit => COMMITTER,
        WorkflowStep::CreatePr => PR_CREATOR,
        WorkflowStep::PrpReview => REVIEWER,
    }
}

/// Dispatch to the step implementation.
pub async fn run_step(
    step: WorkflowStep,
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    context: &StepContext,
) -> StepResult {
    match step {
        WorkflowStep::CreateBranch => {
            run_create_branch_step(executor, loader, work_order_id, working_dir, context).await
        }
        WorkflowStep::Planning => {
            run_planning_step(executor, loader, work_order_id, working_dir, context).await
        }
        WorkflowStep::Execute => {
            run_execute_step(executor, loader, work_order_id, working_dir, context).await
        }
        WorkflowStep::Commit => {
            run_commit_step(executor, loader, work_order_id, working_dir, context).await
        }
        WorkflowStep::CreatePr => {
            run_create_pr_step(executor, loader, work_order_id, working_dir, context).await
        }
        WorkflowStep::PrpReview => {
            run_review_step(executor, loader, work_order_id, working_dir, context).await
        }
    }
}

// What counts as this step's output on a successful CLI run.
enum OutputRule {
    // No result text means the agent didn't do its job: fail the step.
    RequireResult,
    // Fall back to raw stdout, then to a fixed summary.
    StdoutThenDefault(&'static str),
    // Fall back straight to a fixed summary.
    DefaultOnly(&'static str),
}

struct StepCall {
    step: WorkflowStep,
    args: Vec<String>,
    output_rule: OutputRule,
    failure_label: &'static str,
}

async fn invoke(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    call: StepCall,
) -> Result<StepResult, WorkOrderError> {
    let agent = agent_name(call.step);
    let started = Instant::now();

    let command_file = loader.load(call.step.as_str())?;
    let (command, prompt) = executor.build_command(&command_file, &call.args, None)?;
    let outcome = executor
        .execute(&command, working_dir, None, Some(&prompt), Some(work_order_id))
        .await;
    let duration = started.elapsed().as_secs_f64();

    if !outcome.success {
        return Ok(StepResult::failed(
            call.step,
            agent,
            outcome
                .error_message
                .unwrap_or_else(|| call.failure_label.to_string()),
            duration,
        ));
    }

    let result_text = outcome
        .result_text
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let output = match (&call.output_rule, result_text) {
        (_, Some(text)) => Some(text),
        (OutputRule::RequireResult, None) => None,
        (OutputRule::StdoutThenDefault(default), None) => Some(
            outcome
                .stdout
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string(),
        ),
        (OutputRule::DefaultOnly(default), None) => Some(default.to_string()),
    };

    Ok(match output {
        Some(output) => {
            StepResult::succeeded(call.step, agent, output, duration, outcome.session_id)
        }
        None => StepResult::failed(
            call.step,
            agent,
            outcome
                .error_message
                .unwrap_or_else(|| call.failure_label.to_string()),
            duration,
        ),
    })
}

// Shared wrapper: convert any internal error into a failed result.
async fn run_guarded(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    step: WorkflowStep,
    call: Result<StepCall, WorkOrderError>,
) -> StepResult {
    let started = Instant::now();
    let result = match call {
        Ok(call) => invoke(executor, loader, work_order_id, working_dir, call).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(step_result) => step_result,
        Err(err) => {
            error!(step = %step, error = %err, "step_error");
            StepResult::failed(
                step,
                agent_name(step),
                err.to_string(),
                started.elapsed().as_secs_f64(),
            )
        }
    }
}

/// Create a git branch named after the user request. Output: the branch
/// name.
pub async fn run_create_branch_step(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    context: &StepContext,
) -> StepResult {
    let user_request = context.get("user_request").cloned().unwrap_or_default();
    let call = Ok(StepCall {
        step: WorkflowStep::CreateBranch,
        args: vec![user_request],
        output_rule: OutputRule::RequireResult,
        failure_label: "Branch creation failed",
    });
    run_guarded(
        executor,
        loader,
        work_order_id,
        working_dir,
        WorkflowStep::CreateBranch,
        call,
    )
    .await
}

/// Write the implementation plan. Output: the plan file path.
pub async fn run_planning_step(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    context: &StepContext,
) -> StepResult {
    let user_request = context.get("user_request").cloned().unwrap_or_default();
    let issue = context
        .get("github_issue_number")
        .cloned()
        .unwrap_or_default();
    let call = Ok(StepCall {
        step: WorkflowStep::Planning,
        args: vec![user_request, issue],
        output_rule: OutputRule::RequireResult,
        failure_label: "Planning failed",
    });
    run_guarded(
        executor,
        loader,
        work_order_id,
        working_dir,
        WorkflowStep::Planning,
        call,
    )
    .await
}

/// Implement the plan produced by the planning step. Output: a free-form
/// summary.
pub async fn run_execute_step(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    context: &StepContext,
) -> StepResult {
    let call = match context.get("planning").filter(|p| !p.is_empty()) {
        Some(plan_file) => Ok(StepCall {
            step: WorkflowStep::Execute,
            args: vec![plan_file.clone()],
            output_rule: OutputRule::StdoutThenDefault("Implementation completed"),
            failure_label: "Implementation failed",
        }),
        None => Err(WorkOrderError::WorkflowExecution(
            "No plan file found in context. Planning step must run before execute.".to_string(),
        )),
    };
    run_guarded(
        executor,
        loader,
        work_order_id,
        working_dir,
        WorkflowStep::Execute,
        call,
    )
    .await
}

/// Commit and push whatever the implementation produced. Output: commit
/// info from the agent.
pub async fn run_commit_step(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    _context: &StepContext,
) -> StepResult {
    let call = Ok(StepCall {
        step: WorkflowStep::Commit,
        args: vec![],
        output_rule: OutputRule::RequireResult,
        failure_label: "Commit failed",
    });
    run_guarded(
        executor,
        loader,
        work_order_id,
        working_dir,
        WorkflowStep::Commit,
        call,
    )
    .await
}

/// Open the pull request. Output: the PR URL.
pub async fn run_create_pr_step(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    context: &StepContext,
) -> StepResult {
    let plan_file = context.get("planning").cloned().unwrap_or_default();
    let call = match context.get("create-branch").filter(|b| !b.is_empty()) {
        Some(branch) => Ok(StepCall {
            step: WorkflowStep::CreatePr,
            args: vec![branch.clone(), plan_file],
            output_rule: OutputRule::RequireResult,
            failure_label: "PR creation failed",
        }),
        None => Err(WorkOrderError::WorkflowExecution(
            "No branch name found in context. create-branch step must run before create-pr."
                .to_string(),
        )),
    };
    run_guarded(
        executor,
        loader,
        work_order_id,
        working_dir,
        WorkflowStep::CreatePr,
        call,
    )
    .await
}

/// Review the implementation against the plan. Output: the review text.
pub async fn run_review_step(
    executor: &CliExecutor,
    loader: &CommandLoader,
    work_order_id: &str,
    working_dir: &Path,
    context: &StepContext,
) -> StepResult {
    let call = match context.get("planning").filter(|p| !p.is_empty()) {
        Some(plan_file) => Ok(StepCall {
            step: WorkflowStep::PrpReview,
            args: vec![plan_file.clone()],
            output_rule: OutputRule::DefaultOnly("Review completed"),
            failure_label: "Review failed",
        }),
        None => Err(WorkOrderError::WorkflowExecution(
            "No plan file found in context. Planning step must run before review.".to_string(),
        )),
    };
    run_guarded(
        executor,
        loader,
        work_order_id,
        working_dir,
        WorkflowStep::PrpReview,
        call,
    )
    .await
}
