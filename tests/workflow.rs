//! End-to-end workflow runs against a stub agent CLI and throwaway local
//! git repositories. The stub replays one canned JSONL response per
//! invocation, so each scenario scripts the whole conversation up front.

use std::{
    os::unix::fs::PermissionsExt as _,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};

use gaffer::{
    config::{Config, StateBackend},
    models::{SandboxKind, WorkOrderMetadata, WorkOrderState, WorkOrderStatus, WorkflowStep},
    state::{InMemoryRepository, WorkOrderRepository},
    workflow::{WorkflowOrchestrator, WorkflowRequest},
};

const STEP_COMMANDS: [&str; 6] = [
    "create-branch",
    "planning",
    "execute",
    "commit",
    "create-pr",
    "prp-review",
];

struct Fixture {
    temp: tempfile::TempDir,
    config: Arc<Config>,
    repository: Arc<InMemoryRepository>,
    orchestrator: WorkflowOrchestrator,
    origin: PathBuf,
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("running git");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Local repository with a `main` branch and one commit, used as the
/// clone/worktree origin.
fn make_origin(root: &Path) -> PathBuf {
    let origin = root.join("origin");
    std::fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "-b", "main"]);
    git(&origin, &["config", "user.email", "test@example.com"]);
    git(&origin, &["config", "user.name", "Test"]);
    std::fs::write(origin.join("README.md"), "fixture\n").unwrap();
    git(&origin, &["add", "README.md"]);
    git(&origin, &["commit", "-m", "initial"]);
    origin
}

/// Stub CLI: swallows the prompt, then prints the next line of the
/// `responses` file. One line per expected invocation.
fn write_stub_cli(path: &Path, responses: &[&str]) {
    let dir = path.parent().unwrap();
    std::fs::write(dir.join("responses"), responses.join("\n")).unwrap();
    std::fs::write(dir.join("calls"), "0").unwrap();
    let script = r#"#!/bin/sh
dir="$(dirname "$0")"
cat > /dev/null
n=$(cat "$dir/calls")
n=$((n+1))
printf '%s' "$n" > "$dir/calls"
sed -n "${n}p" "$dir/responses"
"#;
    std::fs::write(path, script).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn stub_calls(config: &Config) -> u32 {
    let path = Path::new(&config.cli_path).parent().unwrap().join("calls");
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

async fn fixture(responses: &[&str]) -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let cli_path = temp.path().join("stub-cli");
    write_stub_cli(&cli_path, responses);

    let commands_dir = temp.path().join("commands");
    std::fs::create_dir_all(&commands_dir).unwrap();
    for name in STEP_COMMANDS {
        std::fs::write(
            commands_dir.join(format!("{name}.md")),
            format!("{name}: $ARGUMENTS"),
        )
        .unwrap();
    }

    let config = Arc::new(Config {
        cli_path: cli_path.display().to_string(),
        cli_model: "sonnet".to_string(),
        cli_verbose: true,
        cli_max_turns: None,
        cli_skip_permissions: true,
        execution_timeout: Duration::from_secs(30),
        commands_dir,
        temp_dir: temp.path().join("work"),
        gh_cli_path: "gh".to_string(),
        state_backend: StateBackend::Memory,
        state_dir: temp.path().join("state"),
        database_url: None,
        log_prompts: true,
        log_artifacts: true,
    });

    let repository = Arc::new(InMemoryRepository::new());
    let state: Arc<dyn WorkOrderRepository> = repository.clone();
    let orchestrator = WorkflowOrchestrator::new(config.clone(), state);
    let origin = make_origin(temp.path());
    Fixture {
        temp,
        config,
        repository,
        orchestrator,
        origin,
    }
}

impl Fixture {
    async fn create_work_order(&self, id: &str, sandbox_type: SandboxKind) {
        self.repository
            .create(
                WorkOrderState::new(id.to_string(), self.origin.display().to_string()),
                WorkOrderMetadata::new(sandbox_type, None),
            )
            .await
            .unwrap();
    }

    fn request(
        &self,
        id: &str,
        sandbox_type: SandboxKind,
        selected_commands: Option<Vec<String>>,
    ) -> WorkflowRequest {
        WorkflowRequest {
            work_order_id: id.to_string(),
            repository_url: self.origin.display().to_string(),
            sandbox_type,
            user_request: "Add a foo".to_string(),
            selected_commands,
            github_issue_number: None,
        }
    }

    fn worktree_dir(&self, id: &str) -> PathBuf {
        gaffer::worktree::worktree_path(
            &self.config,
            &self.origin.display().to_string(),
            id,
        )
    }
}

// Happy path: default command sequence in a worktree sandbox, every step
// succeeds, terminal state carries the branch and PR URL.
#[tokio::test]
async fn test_happy_path_worktree() {
    let fx = fixture(&[
        r#"{"type":"result","result":"feat/foo","session_id":"sess-1"}"#,
        r#"{"type":"result","result":"specs/foo.md","session_id":"sess-2"}"#,
        r#"{"type":"result","result":"Done","session_id":"sess-3"}"#,
        r#"{"type":"result","result":"abc123 foo","session_id":"sess-4"}"#,
        r#"{"type":"result","result":"https://github.com/example/repo/pull/7","session_id":"sess-5"}"#,
    ])
    .await;
    let id = "wo-11aa22bb";
    fx.create_work_order(id, SandboxKind::Worktree).await;

    fx.orchestrator
        .execute_workflow(fx.request(id, SandboxKind::Worktree, None))
        .await
        .unwrap();

    let (state, metadata) = fx.repository.get(id).await.unwrap().unwrap();
    assert_eq!(metadata.status, WorkOrderStatus::Completed);
    assert_eq!(state.git_branch_name.as_deref(), Some("feat/foo"));
    assert_eq!(state.agent_session_id.as_deref(), Some("sess-5"));
    assert_eq!(
        metadata.github_pull_request_url.as_deref(),
        Some("https://github.com/example/repo/pull/7")
    );
    assert_eq!(metadata.error_message, None);

    let history = fx.repository.get_step_history(id).await.unwrap().unwrap();
    assert_eq!(history.steps.len(), 5);
    assert!(history.steps.iter().all(|s| s.success));
    let executed: Vec<WorkflowStep> = history.steps.iter().map(|s| s.step).collect();
    assert_eq!(
        executed,
        vec![
            WorkflowStep::CreateBranch,
            WorkflowStep::Planning,
            WorkflowStep::Execute,
            WorkflowStep::Commit,
            WorkflowStep::CreatePr,
        ]
    );
    assert_eq!(history.steps[0].output.as_deref(), Some("feat/foo"));

    // All five steps hit the CLI; the sandbox is gone.
    assert_eq!(stub_calls(&fx.config), 5);
    assert!(!fx.worktree_dir(id).exists());

    // Prompt artifacts were captured per invocation.
    let prompts = fx.config.work_order_dir(id).join("prompts");
    assert_eq!(std::fs::read_dir(prompts).unwrap().count(), 5);
}

// A failing step stops the workflow: later steps never run, the partial
// history is persisted, the sandbox is cleaned up.
#[tokio::test]
async fn test_mid_workflow_failure_stops_and_cleans_up() {
    let fx = fixture(&[
        r#"{"type":"result","result":"feat/foo","session_id":"sess-1"}"#,
        r#"{"type":"result","result":"specs/foo.md","is_error":true,"session_id":"sess-2"}"#,
    ])
    .await;
    let id = "wo-22bb33cc";
    fx.create_work_order(id, SandboxKind::Worktree).await;

    fx.orchestrator
        .execute_workflow(fx.request(
            id,
            SandboxKind::Worktree,
            Some(vec![
                "create-branch".to_string(),
                "planning".to_string(),
                "execute".to_string(),
            ]),
        ))
        .await
        .unwrap();

    let (_, metadata) = fx.repository.get(id).await.unwrap().unwrap();
    assert_eq!(metadata.status, WorkOrderStatus::Failed);
    let error = metadata.error_message.unwrap();
    assert!(error.contains("planning"), "{error}");

    let history = fx.repository.get_step_history(id).await.unwrap().unwrap();
    assert_eq!(history.steps.len(), 2);
    assert!(history.steps[0].success);
    assert!(!history.steps[1].success);

    // `execute` was never invoked.
    assert_eq!(stub_calls(&fx.config), 2);
    assert!(!fx.worktree_dir(id).exists());
}

// Unknown command keys abort the workflow after at most the steps that
// preceded them.
#[tokio::test]
async fn test_unknown_command_rejection() {
    let fx = fixture(&[r#"{"type":"result","result":"feat/foo"}"#]).await;
    let id = "wo-33cc44dd";
    fx.create_work_order(id, SandboxKind::Worktree).await;

    fx.orchestrator
        .execute_workflow(fx.request(
            id,
            SandboxKind::Worktree,
            Some(vec!["create-branch".to_string(), "bogus".to_string()]),
        ))
        .await
        .unwrap();

    let (_, metadata) = fx.repository.get(id).await.unwrap().unwrap();
    assert_eq!(metadata.status, WorkOrderStatus::Failed);
    let error = metadata.error_message.unwrap();
    assert!(error.starts_with("Unknown command"), "{error}");

    let history = fx.repository.get_step_history(id).await.unwrap().unwrap();
    assert!(history.steps.len() <= 1);
    assert!(!fx.worktree_dir(id).exists());
}

// A subprocess that never produces its result gets killed at the timeout
// and the step fails with exit code -1.
#[tokio::test]
async fn test_subprocess_timeout() {
    let fx = fixture(&[]).await;
    // Replace the stub with one that hangs.
    std::fs::write(&fx.config.cli_path, "#!/bin/sh\ncat > /dev/null\nsleep 30\n").unwrap();
    std::fs::set_permissions(
        Path::new(&fx.config.cli_path),
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();

    let mut config = (*fx.config).clone();
    config.execution_timeout = Duration::from_secs(1);
    let config = Arc::new(config);
    let state: Arc<dyn WorkOrderRepository> = fx.repository.clone();
    let orchestrator = WorkflowOrchestrator::new(config.clone(), state);

    let id = "wo-44dd55ee";
    fx.create_work_order(id, SandboxKind::Clone).await;

    orchestrator
        .execute_workflow(fx.request(
            id,
            SandboxKind::Clone,
            Some(vec!["create-branch".to_string()]),
        ))
        .await
        .unwrap();

    let (_, metadata) = fx.repository.get(id).await.unwrap().unwrap();
    assert_eq!(metadata.status, WorkOrderStatus::Failed);
    assert!(metadata.error_message.unwrap().contains("timed out"));

    let history = fx.repository.get_step_history(id).await.unwrap().unwrap();
    assert_eq!(history.steps.len(), 1);
    assert!(!history.steps[0].success);

    // The clone sandbox was torn down.
    assert!(!config.temp_dir.join(format!("sandbox-{id}")).exists());

    // Keep the fixture alive to the end; the stub script lives in it.
    drop(fx.temp);
}
