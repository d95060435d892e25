//! Capability interface over the code-review hosts.
//!
//! The engine never talks HTTP to a host directly; it consumes this
//! trait. Implementations are selected by [`HostType`] through the
//! [`ClientProxy`], never by downcasting. The REST clients themselves
//! live outside the core; [`MockVcsClient`] is provided for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use atlantis_core::models::{CommitStatus, HostType, PullRequest, Repo};
use thiserror::Error;

/// An opaque host API failure.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct VcsError(pub String);

/// Operations the engine needs from a code-review host.
pub trait VcsClient: Send + Sync {
    /// Fetches a pull request by number.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails.
    fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<PullRequest, VcsError>;

    /// Lists the files modified by a pull request, relative to the repo
    /// root.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails.
    fn get_modified_files(&self, repo: &Repo, pull: &PullRequest)
        -> Result<Vec<String>, VcsError>;

    /// Posts a comment on the pull request.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails.
    fn create_comment(&self, repo: &Repo, pull_num: u64, comment: &str) -> Result<(), VcsError>;

    /// Sets the commit status on the pull's head commit.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails.
    fn update_status(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        state: CommitStatus,
        context: &str,
        description: &str,
    ) -> Result<(), VcsError>;

    /// Whether the pull request has been approved.
    ///
    /// # Errors
    ///
    /// Returns [`VcsError`] when the host API call fails.
    fn pull_is_approved(&self, repo: &Repo, pull: &PullRequest) -> Result<bool, VcsError>;
}

/// Routes VCS operations to the client registered for a repo's host.
#[derive(Clone, Default)]
pub struct ClientProxy {
    clients: HashMap<HostType, Arc<dyn VcsClient>>,
}

impl ClientProxy {
    /// An empty proxy with no hosts configured.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the client for a host, replacing any previous one.
    #[must_use]
    pub fn with_client(mut self, host: HostType, client: Arc<dyn VcsClient>) -> Self {
        self.clients.insert(host, client);
        self
    }

    /// The client for `host`, if one is configured.
    #[must_use]
    pub fn client(&self, host: HostType) -> Option<&Arc<dyn VcsClient>> {
        self.clients.get(&host)
    }

    fn routed(&self, repo: &Repo) -> Result<&Arc<dyn VcsClient>, VcsError> {
        self.client(repo.host)
            .ok_or_else(|| VcsError(format!("Atlantis not configured to support {}", repo.host)))
    }
}

impl VcsClient for ClientProxy {
    fn get_pull_request(&self, repo: &Repo, num: u64) -> Result<PullRequest, VcsError> {
        self.routed(repo)?.get_pull_request(repo, num)
    }

    fn get_modified_files(
        &self,
        repo: &Repo,
        pull: &PullRequest,
    ) -> Result<Vec<String>, VcsError> {
        self.routed(repo)?.get_modified_files(repo, pull)
    }

    fn create_comment(&self, repo: &Repo, pull_num: u64, comment: &str) -> Result<(), VcsError> {
        self.routed(repo)?.create_comment(repo, pull_num, comment)
    }

    fn update_status(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        state: CommitStatus,
        context: &str,
        description: &str,
    ) -> Result<(), VcsError> {
        self.routed(repo)?
            .update_status(repo, pull, state, context, description)
    }

    fn pull_is_approved(&self, repo: &Repo, pull: &PullRequest) -> Result<bool, VcsError> {
        self.routed(repo)?.pull_is_approved(repo, pull)
    }
}

/// A recorded `update_status` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedStatus {
    /// Pull number the status was set for.
    pub pull_num: u64,
    /// The state that was set.
    pub state: CommitStatus,
    /// The description that was set.
    pub description: String,
}

/// In-memory [`VcsClient`] recording calls and returning canned data.
pub struct MockVcsClient {
    /// Pull requests returned by `get_pull_request`, keyed by number.
    pub pulls: Mutex<HashMap<u64, PullRequest>>,
    /// Value returned by `get_modified_files`.
    pub modified_files: Mutex<Result<Vec<String>, String>>,
    /// Value returned by `pull_is_approved`.
    pub approved: Mutex<Result<bool, String>>,
    /// Recorded `create_comment` calls as `(pull_num, comment)`.
    pub comments: Mutex<Vec<(u64, String)>>,
    /// Recorded `update_status` calls.
    pub statuses: Mutex<Vec<RecordedStatus>>,
}

impl Default for MockVcsClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVcsClient {
    /// An empty mock: no pulls, no modified files, not approved.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pulls: Mutex::new(HashMap::new()),
            modified_files: Mutex::new(Ok(Vec::new())),
            approved: Mutex::new(Ok(false)),
            comments: Mutex::new(Vec::new()),
            statuses: Mutex::new(Vec::new()),
        }
    }

    /// Registers the pull returned for its number.
    pub fn add_pull(&self, pull: PullRequest) {
        self.pulls.lock().unwrap().insert(pull.num, pull);
    }

    /// Sets the modified-files response.
    pub fn set_modified_files(&self, files: Result<Vec<String>, String>) {
        *self.modified_files.lock().unwrap() = files;
    }

    /// Sets the approval response.
    pub fn set_approved(&self, approved: Result<bool, String>) {
        *self.approved.lock().unwrap() = approved;
    }

    /// The comments posted so far as `(pull_num, comment)`.
    #[must_use]
    pub fn comments(&self) -> Vec<(u64, String)> {
        self.comments.lock().unwrap().clone()
    }

    /// The statuses set so far.
    #[must_use]
    pub fn statuses(&self) -> Vec<RecordedStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

impl VcsClient for MockVcsClient {
    fn get_pull_request(&self, _repo: &Repo, num: u64) -> Result<PullRequest, VcsError> {
        self.pulls
            .lock()
            .unwrap()
            .get(&num)
            .cloned()
            .ok_or_else(|| VcsError(format!("no pull request {num}")))
    }

    fn get_modified_files(
        &self,
        _repo: &Repo,
        _pull: &PullRequest,
    ) -> Result<Vec<String>, VcsError> {
        self.modified_files.lock().unwrap().clone().map_err(VcsError)
    }

    fn create_comment(&self, _repo: &Repo, pull_num: u64, comment: &str) -> Result<(), VcsError> {
        self.comments
            .lock()
            .unwrap()
            .push((pull_num, comment.to_string()));
        Ok(())
    }

    fn update_status(
        &self,
        _repo: &Repo,
        pull: &PullRequest,
        state: CommitStatus,
        _context: &str,
        description: &str,
    ) -> Result<(), VcsError> {
        self.statuses.lock().unwrap().push(RecordedStatus {
            pull_num: pull.num,
            state,
            description: description.to_string(),
        });
        Ok(())
    }

    fn pull_is_approved(&self, _repo: &Repo, _pull: &PullRequest) -> Result<bool, VcsError> {
        self.approved.lock().unwrap().clone().map_err(VcsError)
    }
}
