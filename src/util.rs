use std::fmt::Display;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::error;

use crate::errors::WorkOrderError;

// Generate a fresh work order ID: "wo-" plus 8 random hex chars. 32 bits of
// randomness is plenty for a single process' lifetime of work orders; the
// repository layer still refuses duplicate IDs outright.
pub fn new_work_order_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("wo-{}", hex::encode(bytes))
}

pub fn sandbox_identifier(work_order_id: &str) -> String {
    format!("sandbox-{work_order_id}")
}

// First 8 hex chars of SHA-256 over the URL. This keys on-disk directories
// (the base-clone cache) so it must be stable across runs and Rust versions,
// hence a real digest rather than the stdlib hasher.
pub fn repo_hash(repository_url: &str) -> String {
    let digest = Sha256::digest(repository_url.as_bytes());
    hex::encode(&digest[..4])
}

/// Owner/repo pair parsed out of a GitHub repository reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub repo: String,
}

impl GithubRepo {
    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

impl Display for GithubRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Parse a GitHub repository reference into `(owner, repo)`.
///
/// Accepted forms:
/// - `https://github.com/OWNER/REPO` (optionally with a `.git` suffix)
/// - `git@github.com:OWNER/REPO` (optionally with a `.git` suffix)
/// - bare `OWNER/REPO`
///
/// Anything else is an error; we don't want to silently coerce a typo'd URL
/// into a clone target.
pub fn parse_github_url(url: &str) -> Result<GithubRepo, WorkOrderError> {
    let url = url.trim();
    let invalid = || WorkOrderError::Validation(format!("Invalid GitHub repository URL: {url}"));

    let path = if let Some(rest) = url
        .strip_prefix("https://github.com/")
        .or_else(|| url.strip_prefix("http://github.com/"))
    {
        rest
    } else if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest
    } else if url.contains("://") || url.contains('@') {
        // Some other scheme or host; refuse rather than guess.
        return Err(invalid());
    } else {
        url
    };

    let mut parts = path.split('/');
    let owner = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    let repo = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if repo.is_empty() {
        return Err(invalid());
    }

    Ok(GithubRepo {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}

pub trait ResultExt {
    // Log an error if it occurs, prefixed with s, otherwise return nothing.
    fn or_log_error(&self, s: &str);
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    fn or_log_error(&self, s: &str) {
        if let Err(e) = self {
            error!("{} - {}", s, e);
        }
    }
}
