//! GitHub operations through the `gh` CLI.
//!
//! Only read-side plumbing lives here (repository verification, metadata,
//! issue lookup); pushing branches and opening PRs is the agent's job,
//! driven by the workflow's command files.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    errors::WorkOrderError,
    process::{self, Communicated},
    util::parse_github_url,
};

const GH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub owner: String,
    pub default_branch: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueInfo {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub state: String,
    pub html_url: String,
}

/// What the verify-repository endpoint reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub is_accessible: bool,
    pub repository_name: Option<String>,
    pub repository_owner: Option<String>,
    pub default_branch: Option<String>,
    pub error_message: Option<String>,
}

pub struct GitHubClient {
    gh_cli_path: String,
}

impl GitHubClient {
    pub fn new(gh_cli_path: String) -> Self {
        Self { gh_cli_path }
    }

    async fn gh_json(&self, args: &[&str]) -> Result<Value, WorkOrderError> {
        let cmd = process::command(&self.gh_cli_path, args);
        let result = process::communicate(cmd, None, Some(GH_TIMEOUT))
            .await
            .map_err(|e| WorkOrderError::GitHub(format!("running gh: {e}")))?;
        match result {
            Communicated::TimedOut => Err(WorkOrderError::GitHub(format!(
                "gh {} timed out after {}s",
                args.first().copied().unwrap_or(""),
                GH_TIMEOUT.as_secs()
            ))),
            Communicated::Finished {
                exit_code: 0,
                stdout,
                ..
            } => serde_json::from_str(&stdout)
                .map_err(|e| WorkOrderError::GitHub(format!("parsing gh output: {e}"))),
            Communicated::Finished { stderr, .. } => Err(WorkOrderError::GitHub(if stderr
                .is_empty()
            {
                "Unknown error".to_string()
            } else {
                stderr.trim().to_string()
            })),
        }
    }

    /// Fetch repository metadata, failing if the repo isn't accessible.
    pub async fn repository_info(
        &self,
        repository_url: &str,
    ) -> Result<RepositoryInfo, WorkOrderError> {
        let repo = parse_github_url(repository_url)
            .map_err(|e| WorkOrderError::GitHub(e.to_string()))?;
        let data = self
            .gh_json(&[
                "repo",
                "view",
                &repo.slug(),
                "--json",
                "name,owner,defaultBranchRef",
            ])
            .await?;
        let name = data
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkOrderError::GitHub("missing name in gh output".into()))?;
        let owner = data
            .pointer("/owner/login")
            .and_then(Value::as_str)
            .ok_or_else(|| WorkOrderError::GitHub("missing owner in gh output".into()))?;
        let default_branch = data
            .pointer("/defaultBranchRef/name")
            .and_then(Value::as_str)
            .unwrap_or("main");
        info!(repository_url, "github_repository_info_completed");
        Ok(RepositoryInfo {
            name: name.to_string(),
            owner: owner.to_string(),
            default_branch: default_branch.to_string(),
            url: repository_url.to_string(),
        })
    }

    /// Probe repository access and fold every failure mode into the
    /// response shape instead of an error; the endpoint always answers.
    pub async fn verify_repository(&self, repository_url: &str) -> VerificationOutcome {
        match self.repository_info(repository_url).await {
            Ok(info) => VerificationOutcome {
                is_accessible: true,
                repository_name: Some(info.name),
                repository_owner: Some(info.owner),
                default_branch: Some(info.default_branch),
                error_message: None,
            },
            Err(err) => {
                warn!(repository_url, error = %err, "github_repository_not_accessible");
                VerificationOutcome {
                    is_accessible: false,
                    repository_name: None,
                    repository_owner: None,
                    default_branch: None,
                    error_message: Some(err.to_string()),
                }
            }
        }
    }

    /// Look up an issue so its title/body can be fed into planning.
    pub async fn fetch_issue(
        &self,
        repository_url: &str,
        issue_number: &str,
    ) -> Result<IssueInfo, WorkOrderError> {
        let repo = parse_github_url(repository_url)
            .map_err(|e| WorkOrderError::GitHub(e.to_string()))?;
        let data = self
            .gh_json(&[
                "issue",
                "view",
                issue_number,
                "--repo",
                &repo.slug(),
                "--json",
                "number,title,body,state,url",
            ])
            .await?;
        let number = data
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| WorkOrderError::GitHub("missing issue number in gh output".into()))?;
        Ok(IssueInfo {
            number,
            title: data
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            body: data
                .get("body")
                .and_then(Value::as_str)
                .map(str::to_string),
            state: data
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            html_url: data
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}
