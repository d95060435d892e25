//! Apply-result notifications.
//!
//! After every apply the engine emits an [`ApplyResult`] on the notifier
//! channel. Concrete senders (Slack, HTTP webhooks) live outside the
//! core; [`NullSender`] and [`RecordingSender`] cover wiring and tests.

use std::sync::Mutex;

use atlantis_core::models::{PullRequest, Repo, User};

/// Notification emitted after an apply attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    /// Workspace the apply ran in.
    pub workspace: String,
    /// Who ran the apply.
    pub user: User,
    /// The base repo.
    pub repo: Repo,
    /// The pull request.
    pub pull: PullRequest,
    /// Whether terraform exited zero.
    pub success: bool,
}

/// Delivers apply results to the configured notification targets.
pub trait Sender: Send + Sync {
    /// Sends one result. Delivery is best-effort; failures are logged by
    /// callers, never propagated into the run's outcome.
    fn send(&self, result: &ApplyResult);
}

/// A sender that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSender;

impl Sender for NullSender {
    fn send(&self, _result: &ApplyResult) {}
}

/// A sender that records results for assertions.
#[derive(Debug, Default)]
pub struct RecordingSender {
    results: Mutex<Vec<ApplyResult>>,
}

impl RecordingSender {
    /// An empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The results sent so far.
    #[must_use]
    pub fn results(&self) -> Vec<ApplyResult> {
        self.results.lock().unwrap().clone()
    }
}

impl Sender for RecordingSender {
    fn send(&self, result: &ApplyResult) {
        self.results.lock().unwrap().push(result.clone());
    }
}
