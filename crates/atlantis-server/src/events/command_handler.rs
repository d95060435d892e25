//! Per-PR command dispatch.
//!
//! The handler is the entry point the event ingress calls once a comment
//! has parsed into a command. It fetches the PR, enforces policy (open
//! PR, fork allow-list), claims the per-PR workspace mutex, dispatches
//! the executor, and posts the rendered result plus a commit status.
//!
//! ```text
//! Received -> FetchPR -> PolicyCheck -> TryLockPR -> Execute
//!          -> RenderAndPost -> UnlockPR
//! [any step fails] -> Comment + Status=Failed -> UnlockPR (if held)
//! ```
//!
//! Panics inside an executor are recovered and surfaced as an error
//! comment; they fail the run, never the server.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use atlantis_core::drainer::Drainer;
use atlantis_core::locking::Locker;
use atlantis_core::models::{Command, CommandName, CommitStatus, PullState, Repo, User};
use atlantis_core::runlog::RunLog;
use tracing::{error, warn};

use crate::events::commit_status::CommitStatusUpdater;
use crate::events::workspace_locker::WorkspaceLocker;
use crate::events::{CommandContext, CommandResponse, Executor};
use crate::markdown::Renderer;
use crate::vcs::{ClientProxy, VcsClient};

/// Comment posted when a command arrives during shutdown.
const DRAINING_COMMENT: &str =
    "Atlantis server is shutting down, please try again later.";

/// Dispatches parsed commands through the execution pipeline.
pub struct CommandHandler {
    /// Executor for `plan`.
    pub plan_executor: Arc<dyn Executor>,
    /// Executor for `apply`.
    pub apply_executor: Arc<dyn Executor>,
    /// Host capability clients.
    pub vcs: Arc<ClientProxy>,
    /// Commit status updates.
    pub commit_status: CommitStatusUpdater,
    /// Comment body rendering.
    pub renderer: Arc<dyn Renderer>,
    /// Per-PR workspace mutex.
    pub workspace_locker: Arc<WorkspaceLocker>,
    /// Lock service, for the `unlock` command.
    pub locker: Locker,
    /// Shutdown gate.
    pub drainer: Arc<Drainer>,
    /// Whether commands may run on fork PRs.
    pub allow_fork_prs: bool,
    /// Flag name shown in the fork rejection comment.
    pub allow_fork_prs_flag: String,
}

impl CommandHandler {
    /// Handles one command event.
    ///
    /// `maybe_head_repo` is used for hosts whose comment events carry
    /// the head repo; otherwise the fetched PR supplies it. All
    /// user-visible outcomes are posted as comments; this method never
    /// returns errors because there is nobody upstream to handle them.
    pub fn execute_command(
        &self,
        base_repo: &Repo,
        maybe_head_repo: Option<&Repo>,
        user: &User,
        pull_num: u64,
        command: &Command,
    ) {
        let Some(_guard) = self.drainer.try_start() else {
            warn!(
                repo = %base_repo.full_name,
                pull = pull_num,
                "rejecting command: server is draining"
            );
            self.comment(base_repo, pull_num, DRAINING_COMMENT);
            return;
        };

        let Some(client) = self.vcs.client(base_repo.host) else {
            error!(
                repo = %base_repo.full_name,
                pull = pull_num,
                "Atlantis not configured to support {}",
                base_repo.host
            );
            return;
        };
        let pull = match client.get_pull_request(base_repo, pull_num) {
            Ok(pull) => pull,
            Err(e) => {
                error!(
                    repo = %base_repo.full_name,
                    pull = pull_num,
                    "making pull request API call to {}: {e}",
                    base_repo.host
                );
                return;
            }
        };

        let head_repo = pull
            .head_repo
            .clone()
            .or_else(|| maybe_head_repo.cloned())
            .unwrap_or_else(|| base_repo.clone());

        if pull.state != PullState::Open {
            self.comment(
                base_repo,
                pull_num,
                "Atlantis commands can't be run on closed pull requests",
            );
            return;
        }
        if head_repo.full_name != base_repo.full_name && !self.allow_fork_prs {
            self.comment(
                base_repo,
                pull_num,
                &format!(
                    "Atlantis commands can't be run on fork pull requests. To enable, set \
                     --{}",
                    self.allow_fork_prs_flag
                ),
            );
            return;
        }

        let ctx = CommandContext {
            base_repo: base_repo.clone(),
            head_repo,
            pull,
            user: user.clone(),
            command: command.clone(),
            log: RunLog::new(format!("{}#{pull_num}", base_repo.full_name)),
        };

        if let Err(e) =
            self.commit_status
                .update(&ctx.base_repo, &ctx.pull, CommitStatus::Pending, command.name)
        {
            ctx.log.err(format!("updating commit status: {e}"));
        }

        if !self
            .workspace_locker
            .try_lock(&base_repo.full_name, &command.workspace, pull_num)
        {
            let response = CommandResponse::failure(format!(
                "The {} workspace is currently locked by another command that is running for \
                 this pull request. Wait until the previous command is complete and try again.",
                command.workspace
            ));
            self.render_and_post(&ctx, &response);
            return;
        }

        let response = match catch_unwind(AssertUnwindSafe(|| self.run(&ctx))) {
            Ok(response) => response,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                ctx.log.err(format!("recovered from panic in executor: {message}"));
                CommandResponse::error(format!("worker panic: {message}"))
            }
        };

        self.workspace_locker
            .unlock(&base_repo.full_name, &command.workspace, pull_num);
        self.render_and_post(&ctx, &response);
    }

    /// Dispatches to the executor for the command's name.
    fn run(&self, ctx: &CommandContext) -> CommandResponse {
        match ctx.command.name {
            CommandName::Plan => self.plan_executor.execute(ctx),
            CommandName::Apply => self.apply_executor.execute(ctx),
            CommandName::Unlock => self.unlock_all(ctx),
            CommandName::Help => CommandResponse::default(),
        }
    }

    /// Handles the `unlock` command: bulk-releases the PR's locks.
    fn unlock_all(&self, ctx: &CommandContext) -> CommandResponse {
        match self
            .locker
            .unlock_by_pull(&ctx.base_repo.full_name, ctx.pull.num)
        {
            Ok(released) => {
                ctx.log
                    .info(format!("released {} lock(s) for this pull request", released.len()));
                CommandResponse::default()
            }
            Err(e) => CommandResponse::error(format!("releasing locks: {e}")),
        }
    }

    /// Renders the response, comments, then updates the commit status.
    /// Both calls are best-effort: a dead host API doesn't change the
    /// run's outcome.
    fn render_and_post(&self, ctx: &CommandContext, response: &CommandResponse) {
        let body = self.renderer.render(
            response,
            ctx.command.name,
            &ctx.log.history(),
            ctx.command.verbose,
        );
        if let Err(e) = self.vcs.create_comment(&ctx.base_repo, ctx.pull.num, &body) {
            ctx.log.err(format!("commenting on pull request: {e}"));
        }
        if let Err(e) = self.commit_status.update_result(ctx, ctx.command.name, response) {
            ctx.log.err(format!("updating commit status: {e}"));
        }
    }

    /// Best-effort comment outside a full command context.
    fn comment(&self, repo: &Repo, pull_num: u64, body: &str) {
        if let Err(e) = self.vcs.create_comment(repo, pull_num, body) {
            error!(repo = %repo.full_name, pull = pull_num, "commenting on pull request: {e}");
        }
    }
}

/// Extracts a printable message from a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
