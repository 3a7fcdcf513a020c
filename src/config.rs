use std::{
    env, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context as _};

/// Which state repository backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    File,
    Postgres,
}

impl FromStr for StateBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" => Ok(Self::File),
            "postgres" => Ok(Self::Postgres),
            other => bail!("invalid state backend {other:?}, expected memory, file or postgres"),
        }
    }
}

/// Service configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the agent CLI binary.
    pub cli_path: String,
    /// Model name passed via --model.
    pub cli_model: String,
    /// Pass --verbose. Required when combining --print with
    /// --output-format stream-json, so it defaults on.
    pub cli_verbose: bool,
    /// Pass --max-turns N. None means unlimited.
    pub cli_max_turns: Option<u32>,
    /// Pass --dangerously-skip-permissions for non-interactive automation.
    pub cli_skip_permissions: bool,
    /// Hard wall-clock limit for one CLI invocation.
    pub execution_timeout: Duration,
    /// Directory holding the <name>.md command prompt files.
    pub commands_dir: PathBuf,
    /// Base directory for sandboxes, the base-clone cache and artifacts.
    pub temp_dir: PathBuf,
    /// Path to the GitHub CLI binary.
    pub gh_cli_path: String,
    pub state_backend: StateBackend,
    /// Directory for the file backend's one-JSON-per-id documents.
    pub state_dir: PathBuf,
    /// Connection string for the postgres backend. Checked at startup, not
    /// on first call.
    pub database_url: Option<String>,
    /// Save each prompt under <temp>/<id>/prompts/ for debugging.
    pub log_prompts: bool,
    /// Save raw and parsed JSONL output under <temp>/<id>/outputs/.
    pub log_artifacts: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let temp_dir =
            PathBuf::from(env_or("GAFFER_TEMP_DIR", "/tmp/agent-work-orders".to_string()));
        let state_dir = match env::var("GAFFER_STATE_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => temp_dir.join("state"),
        };
        let state_backend: StateBackend = env_or("GAFFER_STATE_BACKEND", "memory".to_string())
            .parse()
            .context("parsing GAFFER_STATE_BACKEND")?;
        let database_url = env::var("DATABASE_URL").ok();
        if state_backend == StateBackend::Postgres && database_url.is_none() {
            bail!(
                "state backend is postgres but DATABASE_URL is not set; \
                 set it or choose GAFFER_STATE_BACKEND=memory|file"
            );
        }

        Ok(Self {
            cli_path: env_or("AGENT_CLI_PATH", "claude".to_string()),
            cli_model: env_or("AGENT_CLI_MODEL", "sonnet".to_string()),
            cli_verbose: env_bool("AGENT_CLI_VERBOSE", true)?,
            cli_max_turns: env_opt_parse("AGENT_CLI_MAX_TURNS")?,
            cli_skip_permissions: env_bool("AGENT_CLI_SKIP_PERMISSIONS", true)?,
            execution_timeout: Duration::from_secs(
                env_opt_parse("GAFFER_EXECUTION_TIMEOUT")?.unwrap_or(3600),
            ),
            commands_dir: PathBuf::from(env_or("GAFFER_COMMANDS_DIR", "commands".to_string())),
            temp_dir,
            gh_cli_path: env_or("GH_CLI_PATH", "gh".to_string()),
            state_backend,
            state_dir,
            database_url,
            log_prompts: env_bool("GAFFER_LOG_PROMPTS", true)?,
            log_artifacts: env_bool("GAFFER_LOG_ARTIFACTS", true)?,
        })
    }

    /// Create the temp base directory if needed and return it.
    pub fn ensure_temp_dir(&self) -> io::Result<&Path> {
        std::fs::create_dir_all(&self.temp_dir)?;
        Ok(&self.temp_dir)
    }

    /// Per-work-order artifact directory (prompts, outputs).
    pub fn work_order_dir(&self, work_order_id: &str) -> PathBuf {
        self.temp_dir.join(work_order_id)
    }
}

fn env_or(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> anyhow::Result<bool> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => bail!("invalid boolean {other:?} in ${name}"),
        },
    }
}

fn env_opt_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val.parse().with_context(|| format!("parsing ${name}"))?)),
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::path::Path;

    use super::*;

    // A config rooted in a test's tempdir, with the CLI pointed at a stub
    // script the test writes itself.
    pub fn test_config(temp_dir: &Path) -> Config {
        Config {
            cli_path: temp_dir.join("stub-cli").display().to_string(),
            cli_model: "sonnet".to_string(),
            cli_verbose: true,
            cli_max_turns: None,
            cli_skip_permissions: true,
            execution_timeout: Duration::from_secs(30),
            commands_dir: temp_dir.join("commands"),
            temp_dir: temp_dir.join("work"),
            gh_cli_path: "gh".to_string(),
            state_backend: StateBackend::Memory,
            state_dir: temp_dir.join("state"),
            database_url: None,
            log_prompts: false,
            log_artifacts: false,
        }
    }
}
