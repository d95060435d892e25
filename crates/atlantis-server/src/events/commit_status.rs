//! Commit status updates around a run.
//!
//! Statuses use the `Atlantis` context with descriptions like
//! `Plan Pending` or `Apply Failed`: the command and state, title-cased.

use std::sync::Arc;

use atlantis_core::models::{CommandName, CommitStatus, PullRequest, Repo};

use crate::events::{CommandContext, CommandResponse};
use crate::vcs::{VcsClient, VcsError};

/// Context string shown next to the status in the host UI.
const STATUS_CONTEXT: &str = "Atlantis";

/// Pushes commit statuses through the VCS capability.
#[derive(Clone)]
pub struct CommitStatusUpdater {
    client: Arc<dyn VcsClient>,
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}

impl CommitStatusUpdater {
    /// Creates an updater sending through `client`.
    #[must_use]
    pub fn new(client: Arc<dyn VcsClient>) -> Self {
        Self { client }
    }

    /// Sets the status of the pull's head commit.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails; callers treat
    /// this as best-effort.
    pub fn update(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        status: CommitStatus,
        command: CommandName,
    ) -> Result<(), VcsError> {
        let description = format!(
            "{} {}",
            title_case(&command.to_string()),
            title_case(&status.to_string())
        );
        self.client
            .update_status(repo, pull, status, STATUS_CONTEXT, &description)
    }

    /// Sets the aggregate status for a finished run.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails.
    pub fn update_result(
        &self,
        ctx: &CommandContext,
        command: CommandName,
        response: &CommandResponse,
    ) -> Result<(), VcsError> {
        self.update(&ctx.base_repo, &ctx.pull, response.status(), command)
    }
}
