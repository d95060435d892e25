//! The command pipeline: handler, executors and workspace management.
//!
//! Event flow for a single PR comment:
//!
//! ```text
//! comment -> CommandHandler -> Workspace (clone) -> ProjectFinder
//!         -> per project { PreExecutor (Locker, ProjectConfig)
//!                          -> Plan/Apply executor }
//!         -> comment + commit status out
//! ```

pub mod apply_executor;
pub mod command_handler;
pub mod commit_status;
pub mod plan_executor;
pub mod pre_executor;
pub mod pull_closed;
pub mod response;
#[cfg(test)]
pub(crate) mod test_doubles;
pub mod workspace;
pub mod workspace_locker;

use atlantis_core::models::{Command, PullRequest, Repo, User};
use atlantis_core::runlog::RunLog;

pub use response::{CommandResponse, PlanSuccess, ProjectResult};

/// Everything an executor needs to run one command.
///
/// Assembled once per execution by the command handler; immutable from
/// then on (the log handle has interior mutability).
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// The repo the PR will merge into.
    pub base_repo: Repo,
    /// The repo the PR's head branch lives in.
    pub head_repo: Repo,
    /// The pull request being operated on.
    pub pull: PullRequest,
    /// Who triggered the command.
    pub user: User,
    /// The parsed command.
    pub command: Command,
    /// Per-run log handle.
    pub log: RunLog,
}

/// Executes one command kind against a context.
///
/// Implemented by the plan and apply executors; the handler dispatches
/// on the command name.
pub trait Executor: Send + Sync {
    /// Runs the command, never panicking for expected failures.
    fn execute(&self, ctx: &CommandContext) -> CommandResponse;
}

/// The environment exported to terraform and hook processes.
///
/// `WORKSPACE`, `DIR` and `TOOL_VERSION` describe where and what is
/// running; the rest identify the triggering PR for audit trails.
#[must_use]
pub fn command_env(
    ctx: &CommandContext,
    absolute_dir: &std::path::Path,
    workspace: &str,
    terraform_version: &str,
) -> Vec<(String, String)> {
    vec![
        ("WORKSPACE".to_string(), workspace.to_string()),
        ("DIR".to_string(), absolute_dir.display().to_string()),
        ("USER_NAME".to_string(), ctx.user.username.clone()),
        ("TOOL_VERSION".to_string(), terraform_version.to_string()),
        (
            "BASE_REPO_OWNER".to_string(),
            ctx.base_repo.owner.clone(),
        ),
        ("BASE_REPO_NAME".to_string(), ctx.base_repo.name.clone()),
        ("PULL_NUM".to_string(), ctx.pull.num.to_string()),
        ("PULL_AUTHOR".to_string(), ctx.pull.author.clone()),
    ]
}
