use core::fmt;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Execution status of a work order.
///
/// The only legal walk through these is pending -> running -> (completed |
/// failed), with the caveat that reconciliation and the task registry's
/// last-line-of-defense handler may jump straight from pending to a terminal
/// state, and that re-asserting the current terminal state is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkOrderStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkOrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether a status update from `self` to `next` is legal.
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank() || (self == next && self.is_terminal())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl Display for WorkOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sandbox environment variants. `E2b` and `Dagger` are reserved slots that
/// the factory rejects with an explicit "not implemented" error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Clone,
    Worktree,
    E2b,
    Dagger,
}

impl SandboxKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Worktree => "worktree",
            Self::E2b => "e2b",
            Self::Dagger => "dagger",
        }
    }
}

impl Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user-selectable workflow commands. The wire format (and the command
/// file name, and the context key) is the kebab-case form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStep {
    CreateBranch,
    Planning,
    Execute,
    Commit,
    CreatePr,
    PrpReview,
}

/// The default command sequence for a new work order.
pub const DEFAULT_STEP_SEQUENCE: [WorkflowStep; 5] = [
    WorkflowStep::CreateBranch,
    WorkflowStep::Planning,
    WorkflowStep::Execute,
    WorkflowStep::Commit,
    WorkflowStep::CreatePr,
];

impl WorkflowStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateBranch => "create-branch",
            Self::Planning => "planning",
            Self::Execute => "execute",
            Self::Commit => "commit",
            Self::CreatePr => "create-pr",
            Self::PrpReview => "prp-review",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "create-branch" => Some(Self::CreateBranch),
            "planning" => Some(Self::Planning),
            "execute" => Some(Self::Execute),
            "commit" => Some(Self::Commit),
            "create-pr" => Some(Self::CreatePr),
            "prp-review" => Some(Self::PrpReview),
            _ => None,
        }
    }
}

impl Display for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The minimal persisted identity of a work order. Everything else is either
/// metadata or derivable from git.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderState {
    pub work_order_id: String,
    pub repository_url: String,
    pub sandbox_identifier: String,
    pub git_branch_name: Option<String>,
    pub agent_session_id: Option<String>,
}

impl WorkOrderState {
    pub fn new(work_order_id: String, repository_url: String) -> Self {
        let sandbox_identifier = crate::util::sandbox_identifier(&work_order_id);
        Self {
            work_order_id,
            repository_url,
            sandbox_identifier,
            git_branch_name: None,
            agent_session_id: None,
        }
    }
}

/// Denormalized operational fields stored alongside the core state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrderMetadata {
    pub sandbox_type: SandboxKind,
    pub status: WorkOrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub github_issue_number: Option<String>,
    #[serde(default)]
    pub github_pull_request_url: Option<String>,
    #[serde(default)]
    pub git_commit_count: u32,
    #[serde(default)]
    pub git_files_changed: u32,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl WorkOrderMetadata {
    pub fn new(sandbox_type: SandboxKind, github_issue_number: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            sandbox_type,
            status: WorkOrderStatus::Pending,
            created_at: now,
            updated_at: now,
            github_issue_number,
            github_pull_request_url: None,
            git_commit_count: 0,
            git_files_changed: 0,
            error_message: None,
        }
    }
}

/// Extra fields merged into the metadata by `update_status` - the typed
/// rendition of an open-ended kwargs map. Only the fields that are `Some`
/// are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusUpdate {
    pub github_pull_request_url: Option<String>,
    pub git_commit_count: Option<u32>,
    pub git_files_changed: Option<u32>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn apply_to(&self, metadata: &mut WorkOrderMetadata) {
        if let Some(url) = &self.github_pull_request_url {
            metadata.github_pull_request_url = Some(url.clone());
        }
        if let Some(count) = self.git_commit_count {
            metadata.git_commit_count = count;
        }
        if let Some(count) = self.git_files_changed {
            metadata.git_files_changed = count;
        }
        if let Some(message) = &self.error_message {
            metadata.error_message = Some(message.clone());
        }
    }
}

/// Result of one agent CLI (or sandbox shell) invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub stdout: Option<String>,
    /// Extracted text from the JSONL result message, when there was one.
    pub result_text: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: i32,
    pub session_id: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

/// One step attempt, as persisted in the step history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: WorkflowStep,
    pub agent_name: String,
    pub success: bool,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(
        step: WorkflowStep,
        agent_name: &str,
        output: String,
        duration_seconds: f64,
        session_id: Option<String>,
    ) -> Self {
        Self {
            step,
            agent_name: agent_name.to_string(),
            success: true,
            output: Some(output),
            error_message: None,
            duration_seconds,
            session_id,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        step: WorkflowStep,
        agent_name: &str,
        error_message: String,
        duration_seconds: f64,
    ) -> Self {
        Self {
            step,
            agent_name: agent_name.to_string(),
            success: false,
            output: None,
            error_message: Some(error_message),
            duration_seconds,
            session_id: None,
            timestamp: Utc::now(),
        }
    }
}

/// Ordered step attempts for one work order. Insertion order is execution
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepHistory {
    pub work_order_id: String,
    #[serde(default)]
    pub steps: Vec<StepResult>,
}

impl StepHistory {
    pub fn new(work_order_id: impl Into<String>) -> Self {
        Self {
            work_order_id: work_order_id.into(),
            steps: Vec::new(),
        }
    }

    /// Derive the next step to execute from the tail: retry a failed tail,
    /// otherwise advance one past it in the default sequence, `None` once the
    /// sequence is exhausted.
    pub fn next_step(&self) -> Option<WorkflowStep> {
        let last = match self.steps.last() {
            None => return Some(WorkflowStep::CreateBranch),
            Some(last) => last,
        };
        if !last.success {
            return Some(last.step);
        }
        let index = DEFAULT_STEP_SEQUENCE.iter().position(|s| *s == last.step)?;
        DEFAULT_STEP_SEQUENCE.get(index + 1).copied()
    }
}

/// Complete work order view assembled for API consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    pub work_order_id: String,
    pub repository_url: String,
    pub sandbox_identifier: String,
    pub git_branch_name: Option<String>,
    pub agent_session_id: Option<String>,
    pub sandbox_type: SandboxKind,
    pub status: WorkOrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub github_issue_number: Option<String>,
    pub github_pull_request_url: Option<String>,
    pub git_commit_count: u32,
    pub git_files_changed: u32,
    pub error_message: Option<String>,
}

impl WorkOrder {
    pub fn assemble(state: WorkOrderState, metadata: WorkOrderMetadata) -> Self {
        Self {
            work_order_id: state.work_order_id,
            repository_url: state.repository_url,
            sandbox_identifier: state.sandbox_identifier,
            git_branch_name: state.git_branch_name,
            agent_session_id: state.agent_session_id,
            sandbox_type: metadata.sandbox_type,
            status: metadata.status,
            created_at: metadata.created_at,
            updated_at: metadata.updated_at,
            github_issue_number: metadata.github_issue_number,
            github_pull_request_url: metadata.github_pull_request_url,
            git_commit_count: metadata.git_commit_count,
            git_files_changed: metadata.git_files_changed,
            error_message: metadata.error_message,
        }
    }
}

/// Derived git progress for UI display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitProgressSnapshot {
    pub work_order_id: String,
    pub git_commit_count: u32,
    pub git_files_changed: u32,
    pub latest_commit_message: Option<String>,
    pub git_branch_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_step_serde_kebab_case() {
        assert_eq!(
            serde_json::to_string(&WorkflowStep::CreateBranch).unwrap(),
            "\"create-branch\""
        );
        assert_eq!(
            serde_json::from_str::<WorkflowStep>("\"prp-review\"").unwrap(),
            WorkflowStep::PrpReview
        );
        for step in [
            WorkflowStep::CreateBranch,
            WorkflowStep::Planning,
            WorkflowStep::Execute,
            WorkflowStep::Commit,
            WorkflowStep::CreatePr,
            WorkflowStep::PrpReview,
        ] {
            assert_eq!(WorkflowStep::from_key(step.as_str()), Some(step));
        }
        assert_eq!(WorkflowStep::from_key("bogus"), None);
    }

    #[test_case(WorkOrderStatus::Pending, WorkOrderStatus::Running, true)]
    #[test_case(WorkOrderStatus::Running, WorkOrderStatus::Completed, true)]
    #[test_case(WorkOrderStatus::Running, WorkOrderStatus::Failed, true)]
    #[test_case(WorkOrderStatus::Pending, WorkOrderStatus::Failed, true)]
    #[test_case(WorkOrderStatus::Failed, WorkOrderStatus::Failed, true)]
    #[test_case(WorkOrderStatus::Completed, WorkOrderStatus::Completed, true)]
    #[test_case(WorkOrderStatus::Completed, WorkOrderStatus::Failed, false)]
    #[test_case(WorkOrderStatus::Failed, WorkOrderStatus::Completed, false)]
    #[test_case(WorkOrderStatus::Running, WorkOrderStatus::Pending, false)]
    #[test_case(WorkOrderStatus::Completed, WorkOrderStatus::Running, false)]
    #[test_case(WorkOrderStatus::Pending, WorkOrderStatus::Pending, false)]
    fn test_status_transitions(from: WorkOrderStatus, to: WorkOrderStatus, ok: bool) {
        assert_eq!(from.can_advance_to(to), ok);
    }

    #[test]
    fn test_next_step_derivation() {
        let mut history = StepHistory::new("wo-abc123ef");
        assert_eq!(history.next_step(), Some(WorkflowStep::CreateBranch));

        history.steps.push(StepResult::succeeded(
            WorkflowStep::CreateBranch,
            "BranchCreator",
            "feat/foo".into(),
            1.0,
            None,
        ));
        assert_eq!(history.next_step(), Some(WorkflowStep::Planning));

        history.steps.push(StepResult::failed(
            WorkflowStep::Planning,
            "Planner",
            "boom".into(),
            1.0,
        ));
        // Failed tail means retry the same step.
        assert_eq!(history.next_step(), Some(WorkflowStep::Planning));

        history.steps.pop();
        for (step, agent) in [
            (WorkflowStep::Planning, "Planner"),
            (WorkflowStep::Execute, "Implementor"),
            (WorkflowStep::Commit, "Committer"),
            (WorkflowStep::CreatePr, "PrCreator"),
        ] {
            history
                .steps
                .push(StepResult::succeeded(step, agent, "ok".into(), 1.0, None));
        }
        assert_eq!(history.next_step(), None);
    }

    #[test]
    fn test_state_json_round_trip() {
        let state = WorkOrderState::new(
            "wo-abc123ef".into(),
            "https://github.com/example/repo".into(),
        );
        assert_eq!(state.sandbox_identifier, "sandbox-wo-abc123ef");
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(serde_json::from_str::<WorkOrderState>(&json).unwrap(), state);

        let mut metadata = WorkOrderMetadata::new(SandboxKind::Worktree, Some("42".into()));
        metadata.error_message = Some("it broke".into());
        let json = serde_json::to_string(&metadata).unwrap();
        assert_eq!(
            serde_json::from_str::<WorkOrderMetadata>(&json).unwrap(),
            metadata
        );
    }

    #[test]
    fn test_status_update_merge() {
        let mut metadata = WorkOrderMetadata::new(SandboxKind::Clone, None);
        StatusUpdate {
            git_commit_count: Some(3),
            github_pull_request_url: Some("https://github.com/example/repo/pull/7".into()),
            ..StatusUpdate::default()
        }
        .apply_to(&mut metadata);
        assert_eq!(metadata.git_commit_count, 3);
        assert_eq!(metadata.git_files_changed, 0);
        assert_eq!(
            metadata.github_pull_request_url.as_deref(),
            Some("https://github.com/example/repo/pull/7")
        );
        // An empty update leaves everything in place.
        StatusUpdate::default().apply_to(&mut metadata);
        assert_eq!(metadata.git_commit_count, 3);
    }
}
