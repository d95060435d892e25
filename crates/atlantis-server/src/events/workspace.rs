//! The on-disk clone tree.
//!
//! Clones live at `{data_dir}/repos/{repo}/{pull}/{workspace}`. A clone
//! is always fresh: the target directory is removed and recreated before
//! every command so transient corruption cannot persist across runs.
//! Mutation is safe because runs hold the project locks for everything
//! under the directory while they work.

use std::path::{Path, PathBuf};
use std::process::Command;

use atlantis_core::models::{PullRequest, Repo};
use atlantis_core::runlog::RunLog;
use thiserror::Error;

/// Subdirectory of the data dir holding all clones.
const WORKSPACE_PREFIX: &str = "repos";

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Filesystem manipulation failed.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// `git clone` failed. Carries the sanitized URL only.
    #[error("cloning {sanitized_url}: {output}")]
    CloneFailed {
        /// Credential-free clone URL.
        sanitized_url: String,
        /// Combined git output.
        output: String,
    },

    /// `git checkout` of the PR branch failed.
    #[error("checking out branch {branch}: {output}")]
    CheckoutFailed {
        /// The branch that was requested.
        branch: String,
        /// Combined git output.
        output: String,
    },

    /// The workspace directory does not exist (plan was never run).
    #[error("checking if workspace exists at {0:?}")]
    NotFound(PathBuf),
}

/// Owns the clone tree keyed by (repo, PR, workspace).
pub trait Workspace: Send + Sync {
    /// Freshly clones the head repo and checks out the PR branch,
    /// returning the absolute path of the clone root.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] when the directory cannot be prepared
    /// or git fails.
    fn clone_repo(
        &self,
        log: &RunLog,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkspaceError>;

    /// The existing clone root for this repo/pull/workspace.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError::NotFound`] when no clone exists, which
    /// signals that plan was never run.
    fn get_workspace(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkspaceError>;

    /// Deletes every workspace of this repo/pull.
    ///
    /// # Errors
    ///
    /// Returns [`WorkspaceError`] when the tree cannot be removed.
    fn delete(&self, repo: &Repo, pull: &PullRequest) -> Result<(), WorkspaceError>;
}

/// Filesystem-backed [`Workspace`].
#[derive(Debug, Clone)]
pub struct FileWorkspace {
    /// Root data directory.
    pub data_dir: PathBuf,
}

impl FileWorkspace {
    /// Creates a workspace manager rooted at `data_dir`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn repo_pull_dir(&self, repo: &Repo, pull: &PullRequest) -> PathBuf {
        self.data_dir
            .join(WORKSPACE_PREFIX)
            .join(&repo.full_name)
            .join(pull.num.to_string())
    }

    fn clone_dir(&self, repo: &Repo, pull: &PullRequest, workspace: &str) -> PathBuf {
        self.repo_pull_dir(repo, pull).join(workspace)
    }
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> WorkspaceError {
    let context = context.into();
    move |source| WorkspaceError::Io { context, source }
}

#[cfg(unix)]
fn owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}

#[cfg(not(unix))]
fn owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn combined_output(output: &std::process::Output) -> String {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    combined.trim_end().to_string()
}

impl Workspace for FileWorkspace {
    fn clone_repo(
        &self,
        log: &RunLog,
        base_repo: &Repo,
        head_repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let clone_dir = self.clone_dir(base_repo, pull, workspace);

        log.info(format!("cleaning clone directory {clone_dir:?}"));
        match std::fs::remove_dir_all(&clone_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err("deleting old workspace")(e)),
        }

        std::fs::create_dir_all(&clone_dir).map_err(io_err("creating new workspace"))?;
        owner_only(&clone_dir).map_err(io_err("restricting workspace permissions"))?;

        log.info(format!(
            "git cloning {:?} into {clone_dir:?}",
            head_repo.sanitized_clone_url
        ));
        let output = Command::new("git")
            .arg("clone")
            .arg(&head_repo.clone_url)
            .arg(&clone_dir)
            .output()
            .map_err(io_err("running git clone"))?;
        if !output.status.success() {
            return Err(WorkspaceError::CloneFailed {
                sanitized_url: head_repo.sanitized_clone_url.clone(),
                output: combined_output(&output),
            });
        }

        log.info(format!("checking out branch {:?}", pull.branch));
        let output = Command::new("git")
            .arg("checkout")
            .arg(&pull.branch)
            .current_dir(&clone_dir)
            .output()
            .map_err(io_err("running git checkout"))?;
        if !output.status.success() {
            return Err(WorkspaceError::CheckoutFailed {
                branch: pull.branch.clone(),
                output: combined_output(&output),
            });
        }

        Ok(clone_dir)
    }

    fn get_workspace(
        &self,
        repo: &Repo,
        pull: &PullRequest,
        workspace: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let clone_dir = self.clone_dir(repo, pull, workspace);
        if clone_dir.is_dir() {
            Ok(clone_dir)
        } else {
            Err(WorkspaceError::NotFound(clone_dir))
        }
    }

    fn delete(&self, repo: &Repo, pull: &PullRequest) -> Result<(), WorkspaceError> {
        let dir = self.repo_pull_dir(repo, pull);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("deleting workspace")(e)),
        }
    }
}
