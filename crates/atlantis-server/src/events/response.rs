//! Command responses and per-project results.
//!
//! A run produces one [`CommandResponse`]. Fatal problems set `error`,
//! expected negative outcomes set `failure`, and otherwise each project
//! contributes a [`ProjectResult`] carrying its own error/failure/success
//! kind. The three levels are never mixed within one result.

use atlantis_core::models::CommitStatus;

/// A successful plan for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSuccess {
    /// Terraform's output, post-processed for display.
    pub terraform_output: String,
    /// URL of the lock detail page for discarding this plan.
    pub lock_url: String,
}

/// The result of running plan or apply for one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectResult {
    /// Repo-relative path of the project.
    pub path: String,
    /// Workspace the command ran in.
    pub workspace: String,
    /// Internal failure, surfaced verbatim in a fenced block.
    pub error: Option<String>,
    /// Expected negative outcome, surfaced as a one-line message.
    pub failure: String,
    /// Set when a plan succeeded.
    pub plan_success: Option<PlanSuccess>,
    /// Terraform output of a successful apply.
    pub apply_success: String,
}

impl ProjectResult {
    /// The commit status this result contributes to the aggregate.
    #[must_use]
    pub fn status(&self) -> CommitStatus {
        if self.error.is_some() || !self.failure.is_empty() {
            CommitStatus::Failed
        } else {
            CommitStatus::Success
        }
    }
}

/// The outcome of one command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResponse {
    /// Fatal internal failure ending the whole run.
    pub error: Option<String>,
    /// Expected negative outcome ending the whole run.
    pub failure: String,
    /// Per-project outcomes, in execution order.
    pub project_results: Vec<ProjectResult>,
}

impl CommandResponse {
    /// A response carrying a fatal error.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// A response carrying a user-facing failure.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            failure: message.into(),
            ..Self::default()
        }
    }

    /// A response carrying per-project results.
    #[must_use]
    pub fn results(project_results: Vec<ProjectResult>) -> Self {
        Self {
            project_results,
            ..Self::default()
        }
    }

    /// The aggregate commit status: failed if the run failed or any
    /// project did, success otherwise.
    #[must_use]
    pub fn status(&self) -> CommitStatus {
        if self.error.is_some() || !self.failure.is_empty() {
            return CommitStatus::Failed;
        }
        if self
            .project_results
            .iter()
            .any(|r| r.status() == CommitStatus::Failed)
        {
            CommitStatus::Failed
        } else {
            CommitStatus::Success
        }
    }
}
