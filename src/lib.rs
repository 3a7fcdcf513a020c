//! Orchestration core for agent work orders: long-running background jobs
//! that drive an agent CLI through a fixed command sequence against an
//! isolated checkout of a Git repository, producing a branch, commits and
//! (usually) a pull request.
//!
//! The binary in `main.rs` is a thin axum server over this library; see
//! [`http::router`] for the surface and [`workflow::WorkflowOrchestrator`]
//! for the scheduler at the middle of it all.

pub mod commands;
pub mod config;
pub mod errors;
pub mod executor;
pub mod git;
pub mod github;
pub mod http;
pub mod logbuf;
pub mod logging;
pub mod models;
pub mod ports;
pub mod process;
pub mod reconcile;
pub mod registry;
pub mod sandbox;
pub mod sse;
pub mod state;
pub mod steps;
pub mod util;
pub mod workflow;
pub mod worktree;

pub use config::Config;
pub use errors::WorkOrderError;
