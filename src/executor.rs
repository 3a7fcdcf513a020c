//! Agent CLI invocation: build the command line, feed the prompt over
//! stdin, and make sense of the stream-json output.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    errors::WorkOrderError,
    models::CommandOutcome,
    process::{self, Communicated},
};

pub struct CliExecutor {
    config: Arc<Config>,
}

impl CliExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Read the command prompt file, substitute argument placeholders, and
    /// assemble the CLI command line. Returns `(command_line, prompt_text)`;
    /// the prompt goes to the process over stdin, not argv.
    ///
    /// Placeholders: `$ARGUMENTS` becomes the sole argument, or all of them
    /// comma-joined; `$1`..`$N` are positional. Unreplaced placeholders are
    /// left alone - command files are allowed to mention them.
    pub fn build_command(
        &self,
        command_file: &Path,
        args: &[String],
        model: Option<&str>,
    ) -> Result<(String, String), WorkOrderError> {
        let mut prompt = std::fs::read_to_string(command_file).map_err(|e| {
            WorkOrderError::Validation(format!(
                "Failed to read command file {}: {e}",
                command_file.display()
            ))
        })?;

        if !args.is_empty() {
            let joined = if args.len() == 1 {
                args[0].clone()
            } else {
                args.join(", ")
            };
            prompt = prompt.replace("$ARGUMENTS", &joined);
            // Highest index first so $10 isn't clobbered by the $1
            // replacement.
            for (i, arg) in args.iter().enumerate().rev() {
                prompt = prompt.replace(&format!("${}", i + 1), arg);
            }
        }

        let mut parts = vec![
            self.config.cli_path.clone(),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
        ];
        if self.config.cli_verbose {
            // Required for stream-json together with --print.
            parts.push("--verbose".to_string());
        }
        parts.push("--model".to_string());
        parts.push(model.unwrap_or(&self.config.cli_model).to_string());
        if let Some(max_turns) = self.config.cli_max_turns {
            parts.push("--max-turns".to_string());
            parts.push(max_turns.to_string());
        }
        if self.config.cli_skip_permissions {
            parts.push("--dangerously-skip-permissions".to_string());
        }

        Ok((parts.join(" "), prompt))
    }

    /// Run the CLI in `working_dir`, bounded by `timeout` (defaulting to the
    /// configured execution timeout). Never returns Err: every failure mode
    /// is folded into the outcome so step functions have one shape to map.
    pub async fn execute(
        &self,
        command: &str,
        working_dir: &Path,
        timeout: Option<Duration>,
        prompt_text: Option<&str>,
        work_order_id: Option<&str>,
    ) -> CommandOutcome {
        let timeout = timeout.unwrap_or(self.config.execution_timeout);
        info!(
            command,
            working_dir = %working_dir.display(),
            timeout_seconds = timeout.as_secs(),
            "agent_command_started"
        );

        if let (Some(id), Some(prompt)) = (work_order_id, prompt_text) {
            self.save_prompt(prompt, id);
        }

        let started = Instant::now();
        let cmd = process::shell(command, working_dir);
        let communicated = process::communicate(
            cmd,
            prompt_text.map(|p| p.as_bytes().to_vec()),
            Some(timeout),
        )
        .await;

        let duration = started.elapsed().as_secs_f64();
        let (exit_code, stdout, stderr) = match communicated {
            Err(err) => {
                error!(command, error = %err, "agent_command_error");
                return CommandOutcome {
                    success: false,
                    exit_code: -1,
                    error_message: Some(err.to_string()),
                    duration_seconds: duration,
                    ..CommandOutcome::default()
                };
            }
            Ok(Communicated::TimedOut) => {
                error!(command, timeout_seconds = timeout.as_secs(), "agent_command_timeout");
                return CommandOutcome {
                    success: false,
                    exit_code: -1,
                    error_message: Some(
                        WorkOrderError::Timeout {
                            seconds: timeout.as_secs(),
                        }
                        .to_string(),
                    ),
                    duration_seconds: duration,
                    ..CommandOutcome::default()
                };
            }
            Ok(Communicated::Finished {
                exit_code,
                stdout,
                stderr,
            }) => (exit_code, stdout, stderr),
        };

        if let Some(id) = work_order_id {
            if !stdout.is_empty() {
                self.save_output_artifacts(&stdout, id);
            }
        }

        let session_id = extract_session_id(&stdout);
        let result_message = extract_result_message(&stdout);
        let result_text = result_message.as_ref().and_then(result_text_of);

        let mut success = exit_code == 0;
        let mut error_message = None;
        if let Some(message) = &result_message {
            if message.get("subtype").and_then(Value::as_str) == Some("error_during_execution") {
                success = false;
                error_message = Some(
                    "Error during execution: agent reported an error and returned no result"
                        .to_string(),
                );
            } else if message.get("is_error").and_then(Value::as_bool) == Some(true) {
                success = false;
                error_message = Some(
                    result_text
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string()),
                );
            }
        }
        if error_message.is_none() && !success {
            error_message = Some(if stderr.is_empty() {
                "Command failed".to_string()
            } else {
                stderr.clone()
            });
        }

        if let Some(text) = &result_text {
            let preview: String = text.chars().take(100).collect();
            debug!(result_text_preview = %preview, "result_text_extracted");
        }

        if success {
            info!(session_id = session_id.as_deref(), duration, "agent_command_completed");
        } else {
            error!(exit_code, duration, error = error_message.as_deref(), "agent_command_failed");
        }

        CommandOutcome {
            success,
            stdout: Some(stdout),
            result_text,
            stderr: Some(stderr),
            exit_code,
            session_id,
            error_message,
            duration_seconds: duration,
        }
    }

    // Artifact capture is best-effort debugging aid; a full disk must not
    // fail the step.
    fn save_prompt(&self, prompt_text: &str, work_order_id: &str) {
        if !self.config.log_prompts {
            return;
        }
        if let Err(err) = self.try_save_prompt(prompt_text, work_order_id) {
            warn!(error = %err, "prompt_save_failed");
        }
    }

    fn try_save_prompt(&self, prompt_text: &str, work_order_id: &str) -> std::io::Result<PathBuf> {
        let dir = self.config.work_order_dir(work_order_id).join("prompts");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("prompt_{}.txt", artifact_stamp()));
        std::fs::write(&path, prompt_text)?;
        info!(path = %path.display(), "prompt_saved");
        Ok(path)
    }

    fn save_output_artifacts(&self, jsonl_output: &str, work_order_id: &str) {
        if !self.config.log_artifacts {
            return;
        }
        if let Err(err) = self.try_save_output_artifacts(jsonl_output, work_order_id) {
            warn!(error = %err, "output_artifacts_save_failed");
        }
    }

    fn try_save_output_artifacts(
        &self,
        jsonl_output: &str,
        work_order_id: &str,
    ) -> std::io::Result<()> {
        let dir = self.config.work_order_dir(work_order_id).join("outputs");
        std::fs::create_dir_all(&dir)?;
        let stamp = artifact_stamp();

        let jsonl_path = dir.join(format!("output_{stamp}.jsonl"));
        std::fs::write(&jsonl_path, jsonl_output)?;

        // Also store the stream as one JSON array; much easier to eyeball.
        let messages: Vec<Value> = jsonl_output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let json_path = dir.join(format!("output_{stamp}.json"));
        match serde_json::to_vec_pretty(&messages) {
            Ok(bytes) => std::fs::write(&json_path, bytes)?,
            Err(err) => warn!(error = %err, "jsonl_to_json_conversion_failed"),
        }

        info!(jsonl = %jsonl_path.display(), "output_artifacts_saved");
        Ok(())
    }
}

fn artifact_stamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S%3f").to_string()
}

/// First `session_id` in the stream; the CLI emits it on its init message.
fn extract_session_id(jsonl_output: &str) -> Option<String> {
    jsonl_output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find_map(|value| {
            value
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

/// The terminal result message: last object with `type == "result"`. It
/// should be the final line but we scan from the end to be safe; invalid
/// lines are ignored.
fn extract_result_message(jsonl_output: &str) -> Option<Value> {
    jsonl_output
        .lines()
        .rev()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .find(|value| value.get("type").and_then(Value::as_str) == Some("result"))
}

fn result_text_of(message: &Value) -> Option<String> {
    match message.get("result")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::test_utils::test_config;

    fn executor(temp: &tempfile::TempDir) -> CliExecutor {
        CliExecutor::new(Arc::new(test_config(temp.path())))
    }

    fn write_command_file(temp: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = temp.path().join("cmd.md");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_build_command_flags_and_placeholders() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor(&temp);
        let file = write_command_file(&temp, "Request: $ARGUMENTS ($1 then $2), keep $UNSET");

        let (command, prompt) = executor
            .build_command(&file, &["first".into(), "second".into()], None)
            .unwrap();
        assert_eq!(
            command,
            format!(
                "{} --print --output-format stream-json --verbose --model sonnet \
                 --dangerously-skip-permissions",
                temp.path().join("stub-cli").display()
            )
        );
        assert_eq!(
            prompt,
            "Request: first, second (first then second), keep $UNSET"
        );

        // A single argument substitutes $ARGUMENTS directly.
        let (_, prompt) = executor
            .build_command(&file, &["only".into()], Some("opus"))
            .unwrap();
        assert_eq!(prompt, "Request: only (only then $2), keep $UNSET");
    }

    #[test]
    fn test_build_command_max_turns_and_model_override() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.cli_max_turns = Some(12);
        config.cli_verbose = false;
        config.cli_skip_permissions = false;
        let executor = CliExecutor::new(Arc::new(config));
        let file = write_command_file(&temp, "hi");

        let (command, _) = executor.build_command(&file, &[], Some("opus")).unwrap();
        assert!(command.contains("--model opus"), "{command}");
        assert!(command.contains("--max-turns 12"), "{command}");
        assert!(!command.contains("--verbose"), "{command}");
        assert!(!command.contains("--dangerously-skip-permissions"), "{command}");
    }

    #[test]
    fn test_build_command_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor(&temp);
        let err = executor
            .build_command(&temp.path().join("nope.md"), &[], None)
            .unwrap_err();
        assert!(matches!(err, WorkOrderError::Validation(_)));
    }

    #[test]
    fn test_jsonl_extraction() {
        let stream = indoc! {r#"
            {"type":"system","session_id":"sess-1","model":"sonnet"}
            not json at all
            {"type":"assistant","message":"thinking"}
            {"type":"result","result":"feat/foo","session_id":"sess-1"}
        "#};
        assert_eq!(extract_session_id(stream).as_deref(), Some("sess-1"));
        let message = extract_result_message(stream).unwrap();
        assert_eq!(result_text_of(&message).as_deref(), Some("feat/foo"));

        // Non-string results are stringified.
        let message: Value = serde_json::from_str(r#"{"type":"result","result":{"n":3}}"#).unwrap();
        assert_eq!(result_text_of(&message).as_deref(), Some(r#"{"n":3}"#));
        let message: Value = serde_json::from_str(r#"{"type":"result"}"#).unwrap();
        assert_eq!(result_text_of(&message), None);
    }

    #[tokio::test]
    async fn test_execute_success_parses_stream() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor(&temp);
        let command = r#"echo '{"type":"system","session_id":"sess-9"}'; echo '{"type":"result","result":"done"}'"#;
        let outcome = executor
            .execute(command, temp.path(), None, Some("the prompt"), None)
            .await;
        assert!(outcome.success, "{outcome:?}");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.session_id.as_deref(), Some("sess-9"));
        assert_eq!(outcome.result_text.as_deref(), Some("done"));
        assert_eq!(outcome.error_message, None);
    }

    #[tokio::test]
    async fn test_execute_agent_error_result() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor(&temp);
        // Exit 0 but the stream says the agent failed.
        let command =
            r#"echo '{"type":"result","result":"it broke","is_error":true,"session_id":"s"}'"#;
        let outcome = executor.execute(command, temp.path(), None, None, None).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_message.as_deref(), Some("it broke"));

        let command = r#"echo '{"type":"result","subtype":"error_during_execution"}'"#;
        let outcome = executor.execute(command, temp.path(), None, None, None).await;
        assert!(!outcome.success);
        assert!(outcome
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Error during execution"));
    }

    #[tokio::test]
    async fn test_execute_nonzero_exit_prefers_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor(&temp);
        let outcome = executor
            .execute("echo 'broken pipe' >&2; exit 7", temp.path(), None, None, None)
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, 7);
        assert_eq!(outcome.error_message.as_deref(), Some("broken pipe\n"));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let temp = tempfile::tempdir().unwrap();
        let executor = executor(&temp);
        let outcome = executor
            .execute(
                "sleep 30",
                temp.path(),
                Some(Duration::from_millis(200)),
                None,
                None,
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.error_message.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_artifacts_saved_when_enabled() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = test_config(temp.path());
        config.log_prompts = true;
        config.log_artifacts = true;
        let executor = CliExecutor::new(Arc::new(config.clone()));

        executor
            .execute(
                r#"echo '{"type":"result","result":"ok"}'"#,
                temp.path(),
                None,
                Some("prompt body"),
                Some("wo-deadbeef"),
            )
            .await;

        let base = config.work_order_dir("wo-deadbeef");
        let prompts: Vec<_> = std::fs::read_dir(base.join("prompts")).unwrap().collect();
        assert_eq!(prompts.len(), 1);
        let outputs: Vec<_> = std::fs::read_dir(base.join("outputs")).unwrap().collect();
        assert_eq!(outputs.len(), 2, "expected .jsonl and .json");
    }
}
