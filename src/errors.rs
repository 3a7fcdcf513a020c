use std::path::PathBuf;

use thiserror::Error;

/// Error kinds that the orchestration core routes through its failure
/// handling. Everything user-visible ends up as a `failed` work order with a
/// non-empty message, so the Display impls here are written to be shown
/// as-is.
#[derive(Debug, Error)]
pub enum WorkOrderError {
    #[error("Command file not found: {name} (expected at {})", .path.display())]
    CommandNotFound { name: String, path: PathBuf },

    #[error("Sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("Command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Agent CLI error: {0}")]
    CliAgent(String),

    #[error("GitHub operation failed: {0}")]
    GitHub(String),

    // No prefix: the payload already reads as a complete message ("Unknown
    // command: ...", "Command 'planning' failed: ...").
    #[error("{0}")]
    WorkflowExecution(String),

    #[error("State repository error: {0}")]
    StateRepository(String),

    #[error("{0}")]
    Validation(String),
}

impl From<sqlx::Error> for WorkOrderError {
    fn from(err: sqlx::Error) -> Self {
        Self::StateRepository(err.to_string())
    }
}
