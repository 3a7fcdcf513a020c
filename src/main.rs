use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gaffer::{
    config::Config,
    github::GitHubClient,
    http::{self, AppState},
    logbuf::{self, LogBuffer},
    logging,
    process::{self, Communicated},
    registry::TaskRegistry,
    state,
    workflow::WorkflowOrchestrator,
};

#[derive(Parser, Debug)]
#[command(version, about = "Agent work order orchestration service")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8053)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(Config::from_env().context("loading configuration")?);
    config.ensure_temp_dir().context("creating temp dir")?;

    let log_buffer = Arc::new(LogBuffer::new());
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    logging::init(&log_level, log_buffer.clone());

    validate_tooling(&config).await;

    let repository = state::create_repository(&config)
        .await
        .context("creating state repository")?;
    let orchestrator = Arc::new(WorkflowOrchestrator::new(config.clone(), repository.clone()));
    let registry = TaskRegistry::new();
    let github = Arc::new(GitHubClient::new(config.gh_cli_path.clone()));

    let shutdown = CancellationToken::new();
    let cleanup_task = logbuf::spawn_cleanup_task(log_buffer.clone(), shutdown.clone());

    let router = http::router(AppState {
        config: config.clone(),
        repository,
        registry,
        orchestrator,
        github,
        log_buffer,
    });

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "server_started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;

    info!("server_shutting_down");
    shutdown.cancel();
    let _ = cleanup_task.await;
    Ok(())
}

// Probe the external tools once at boot. Missing tools are warnings, not
// fatal: a service restart shouldn't be blocked by a CLI that only matters
// once a work order actually runs.
async fn validate_tooling(config: &Config) {
    for (label, path) in [("agent CLI", config.cli_path.as_str()), ("git", "git")] {
        let cmd = process::command(path, ["--version"]);
        match process::communicate(cmd, None, Some(std::time::Duration::from_secs(5))).await {
            Ok(Communicated::Finished {
                exit_code: 0,
                stdout,
                ..
            }) => info!(tool = label, version = stdout.trim(), "tool_validated"),
            Ok(Communicated::Finished { stderr, .. }) => {
                warn!(tool = label, stderr = %stderr, "tool_validation_failed")
            }
            Ok(Communicated::TimedOut) => warn!(tool = label, "tool_validation_timed_out"),
            Err(err) => warn!(tool = label, error = %err, "tool_not_found"),
        }
    }
}
