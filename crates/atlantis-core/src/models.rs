//! Domain models shared across the engine.
//!
//! Every model here is immutable per event: the webhook ingress builds
//! them once and the executors only read them. Validation happens in the
//! constructors so invalid repos or projects cannot flow downstream.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors raised while constructing models from untrusted event data.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The repo full name was empty.
    #[error("repoFullName can't be empty")]
    EmptyRepoFullName,

    /// The clone URL was empty.
    #[error("cloneURL can't be empty")]
    EmptyCloneURL,

    /// The clone URL could not be parsed.
    #[error("invalid clone url: {0}")]
    InvalidCloneURL(#[from] url::ParseError),

    /// The clone URL path did not match the repo full name.
    #[error("expected clone url to have path {expected:?} but had {actual:?}")]
    CloneURLWrongRepo {
        /// The path derived from the full name.
        expected: String,
        /// The path found in the clone URL.
        actual: String,
    },

    /// The repo full name was not `owner/name` (or `owner/project/repo`
    /// for Bitbucket Server).
    #[error("invalid repo format {0:?}")]
    InvalidRepoFormat(String),

    /// Credentials could not be injected into the clone URL.
    #[error("injecting credentials into clone url")]
    CredentialInjection,
}

/// The code-review host a repo lives on.
///
/// Capability implementations are selected by this discriminator; there is
/// no trait-object downcasting anywhere in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostType {
    /// github.com or GitHub Enterprise.
    Github,
    /// gitlab.com or self-hosted GitLab.
    Gitlab,
    /// bitbucket.org.
    BitbucketCloud,
    /// Self-hosted Bitbucket Server / Data Center.
    BitbucketServer,
    /// dev.azure.com.
    AzureDevops,
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Github => write!(f, "GitHub"),
            Self::Gitlab => write!(f, "GitLab"),
            Self::BitbucketCloud => write!(f, "Bitbucket Cloud"),
            Self::BitbucketServer => write!(f, "Bitbucket Server"),
            Self::AzureDevops => write!(f, "Azure DevOps"),
        }
    }
}

/// A repository on a code-review host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Which host this repo lives on.
    pub host: HostType,
    /// Full name, ex. `owner/repo`.
    pub full_name: String,
    /// Owner segment of the full name.
    pub owner: String,
    /// Name segment of the full name.
    pub name: String,
    /// HTTPS clone URL with credentials injected.
    pub clone_url: String,
    /// Clone URL without credentials, safe for logs and comments.
    pub sanitized_clone_url: String,
}

impl Default for Repo {
    fn default() -> Self {
        Self {
            host: HostType::Github,
            full_name: String::new(),
            owner: String::new(),
            name: String::new(),
            clone_url: String::new(),
            sanitized_clone_url: String::new(),
        }
    }
}

impl Repo {
    /// Builds a validated repo from event data, injecting `user:token`
    /// credentials into the clone URL.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelError`] if the full name or clone URL is empty,
    /// the URL does not parse, its path does not match the full name, or
    /// the full name is not `owner/name` (`owner/project/repo` is accepted
    /// for Bitbucket Server).
    pub fn new(
        host: HostType,
        full_name: &str,
        clone_url: &str,
        user: &str,
        token: &str,
    ) -> Result<Self, ModelError> {
        if full_name.is_empty() {
            return Err(ModelError::EmptyRepoFullName);
        }
        if clone_url.is_empty() {
            return Err(ModelError::EmptyCloneURL);
        }

        let sanitized = Url::parse(clone_url)?;
        let expected_path = format!("/{full_name}.git");
        if sanitized.path() != expected_path {
            return Err(ModelError::CloneURLWrongRepo {
                expected: expected_path,
                actual: sanitized.path().to_string(),
            });
        }

        let (owner, name) = split_repo_full_name(full_name);
        if owner.is_empty() || name.is_empty() {
            return Err(ModelError::InvalidRepoFormat(full_name.to_string()));
        }
        let segments = full_name.split('/').count();
        let max_segments = if host == HostType::BitbucketServer { 3 } else { 2 };
        if segments > max_segments || full_name.split('/').any(str::is_empty) {
            return Err(ModelError::InvalidRepoFormat(full_name.to_string()));
        }

        let mut authed = sanitized.clone();
        authed
            .set_username(user)
            .map_err(|()| ModelError::CredentialInjection)?;
        authed
            .set_password(Some(token))
            .map_err(|()| ModelError::CredentialInjection)?;

        Ok(Self {
            host,
            full_name: full_name.to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            clone_url: authed.to_string(),
            sanitized_clone_url: sanitized.to_string(),
        })
    }
}

/// Splits a repo full name into `(owner, name)`.
///
/// Owner is the first segment and name the last, so Bitbucket Server's
/// `owner/project/repo` form yields `("owner", "repo")`. Returns empty
/// strings when either side is missing.
#[must_use]
pub fn split_repo_full_name(full_name: &str) -> (&str, &str) {
    match (full_name.find('/'), full_name.rfind('/')) {
        (Some(first), Some(last)) if first > 0 && last + 1 < full_name.len() => {
            (&full_name[..first], &full_name[last + 1..])
        }
        _ => ("", ""),
    }
}

/// Whether a pull request is open or closed on its host.
///
/// Hosts with a separate "merged" state are mapped to `Closed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PullState {
    /// The PR accepts new commands.
    #[default]
    Open,
    /// The PR is closed or merged; commands are rejected.
    Closed,
}

/// A pull (or merge) request on a code-review host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// PR number, unique within the base repo.
    pub num: u64,
    /// Name of the head branch.
    pub branch: String,
    /// SHA of the head commit.
    pub head_commit: String,
    /// Login of the PR author.
    pub author: String,
    /// Browser URL of the PR.
    pub url: String,
    /// Open or closed.
    pub state: PullState,
    /// Repo the PR will merge into.
    #[serde(default)]
    pub base_repo: Option<Repo>,
    /// Repo the PR's head branch lives in (differs on forks).
    #[serde(default)]
    pub head_repo: Option<Repo>,
}

/// The user that triggered a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Login on the code-review host.
    pub username: String,
}

/// A directory inside a repository containing terraform files.
///
/// Equality is structural: two projects are the same iff both repo full
/// name and normalised path match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Project {
    /// Full name of the repo this project belongs to.
    pub repo_full_name: String,
    /// Path relative to the repo root. Never ends in `/`; `.` means the
    /// repo root; never contains `..`.
    pub path: String,
}

impl Project {
    /// Builds a project with the path normalised.
    #[must_use]
    pub fn new(repo_full_name: &str, path: &str) -> Self {
        Self {
            repo_full_name: repo_full_name.to_string(),
            path: clean_project_path(path),
        }
    }
}

/// Normalises a repo-relative path: strips `./` prefixes, leading and
/// trailing slashes, and maps the empty path to `.`.
fn clean_project_path(path: &str) -> String {
    let mut cleaned: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            other => cleaned.push(other),
        }
    }
    if cleaned.is_empty() {
        ".".to_string()
    } else {
        cleaned.join("/")
    }
}

/// The action a parsed comment asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    /// Run `terraform plan`.
    Plan,
    /// Apply a previously created plan.
    Apply,
    /// Release every lock this PR holds.
    Unlock,
    /// Print usage.
    Help,
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Apply => write!(f, "apply"),
            Self::Unlock => write!(f, "unlock"),
            Self::Help => write!(f, "help"),
        }
    }
}

/// A fully parsed comment command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Which action to run.
    pub name: CommandName,
    /// Terraform workspace, defaults to `default`.
    pub workspace: String,
    /// Path relative to the repo root to run in. Empty string means "not
    /// specified"; `.` is the repo root. Never ends in `/`.
    pub dir: String,
    /// Whether to append the command log to the result comment.
    pub verbose: bool,
    /// Extra flags appended to the terraform invocation, each already
    /// shell-quoted.
    pub flags: Vec<String>,
}

impl Command {
    /// Builds a command with defaults for everything but the name.
    #[must_use]
    pub fn new(name: CommandName) -> Self {
        Self {
            name,
            workspace: DEFAULT_WORKSPACE.to_string(),
            dir: String::new(),
            verbose: false,
            flags: Vec::new(),
        }
    }
}

/// The workspace used when a comment doesn't name one.
pub const DEFAULT_WORKSPACE: &str = "default";

/// State reported to the host's commit-status API around a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    /// Command accepted, work starting.
    Pending,
    /// Run finished with every project successful.
    Success,
    /// Run errored or at least one project failed.
    Failed,
}

impl fmt::Display for CommitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
