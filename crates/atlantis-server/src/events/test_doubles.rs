//! Shared doubles for executor and handler tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use atlantis_core::locking::{lock_key, LockError, LockStore, ProjectLock};
use atlantis_core::models::{Command, CommandName, HostType, PullRequest, Repo, User};
use atlantis_core::runlog::RunLog;
use atlantis_core::terraform::{TerraformError, TerraformRunner};

use crate::events::workspace::{Workspace, WorkspaceError};
use crate::events::CommandContext;

/// Lock store over a plain map, for tests that don't need durability.
#[derive(Default)]
pub struct InMemoryLockStore {
    locks: Mutex<HashMap<String, ProjectLock>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.locks.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl LockStore for InMemoryLockStore {
    fn try_lock(&self, new_lock: &ProjectLock) -> Result<(bool, ProjectLock), LockError> {
        let key = lock_key(&new_lock.project, &new_lock.workspace);
        let mut locks = self.locks.lock().unwrap();
        if let Some(curr) = locks.get(&key) {
            Ok((false, curr.clone()))
        } else {
            locks.insert(key, new_lock.clone());
            Ok((true, new_lock.clone()))
        }
    }

    fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        Ok(self.locks.lock().unwrap().remove(key))
    }

    fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        Ok(self.locks.lock().unwrap().get(key).cloned())
    }

    fn list(&self) -> Result<Vec<(String, ProjectLock)>, LockError> {
        let locks = self.locks.lock().unwrap();
        let mut entries: Vec<(String, ProjectLock)> =
            locks.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn unlock_by_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<ProjectLock>, LockError> {
        let mut locks = self.locks.lock().unwrap();
        let matching: Vec<String> = locks
            .iter()
            .filter(|(_, l)| {
                l.project.repo_full_name == repo_full_name && l.pull.num == pull_num
            })
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed: Vec<ProjectLock> = matching
            .into_iter()
            .filter_map(|k| locks.remove(&k))
            .collect();
        removed.sort_by(|a, b| a.project.path.cmp(&b.project.path));
        Ok(removed)
    }
}

/// A recorded terraform invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerraformCall {
    pub dir: PathBuf,
    pub args: Vec<String>,
    pub version: Option<String>,
    pub workspace: String,
}

/// Scriptable [`TerraformRunner`] double.
pub struct MockTerraform {
    default_version: String,
    /// Versions considered installed besides the default.
    pub installed: Mutex<HashSet<String>>,
    /// Subcommands (`args[0]`) that fail, with the canned output.
    pub failures: Mutex<HashMap<String, String>>,
    /// Output returned by successful runs.
    pub output: Mutex<String>,
    /// Recorded calls.
    pub calls: Mutex<Vec<TerraformCall>>,
}

impl MockTerraform {
    pub fn new(default_version: &str) -> Self {
        Self {
            default_version: default_version.to_string(),
            installed: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            output: Mutex::new(String::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_on(&self, subcommand: &str, output: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(subcommand.to_string(), output.to_string());
    }

    pub fn set_output(&self, output: &str) {
        *self.output.lock().unwrap() = output.to_string();
    }

    pub fn calls(&self) -> Vec<TerraformCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The recorded calls whose subcommand matches.
    pub fn calls_for(&self, subcommand: &str) -> Vec<TerraformCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.args.first().map(String::as_str) == Some(subcommand))
            .collect()
    }
}

impl TerraformRunner for MockTerraform {
    fn default_version(&self) -> &str {
        &self.default_version
    }

    fn version_installed(&self, version: &str) -> bool {
        version == self.default_version || self.installed.lock().unwrap().contains(version)
    }

    fn run_command_with_version(
        &self,
        _log: &RunLog,
        path: &Path,
        args: &[String],
        version: Option<&str>,
        workspace: &str,
        _extra_env: &[(String, String)],
    ) -> Result<String, TerraformError> {
        self.calls.lock().unwrap().push(TerraformCall {
            dir: path.to_path_buf(),
            args: args.to_vec(),
            version: version.map(ToString::to_string),
            workspace: workspace.to_string(),
        });

        let subcommand = args.first().cloned().unwrap_or_default();
        if let Some(output) = self.failures.lock().unwrap().get(&subcommand) {
            return Err(TerraformError::CommandFailed {
                command: format!("terraform {}", args.join(" ")),
                dir: path.display().to_string(),
                status: 1,
                output: output.clone(),
            });
        }
        Ok(self.output.lock().unwrap().clone())
    }
}

/// [`Workspace`] double serving a fixed directory.
pub struct MockWorkspace {
    /// Directory returned by clone and get. `None` simulates failure /
    /// absence.
    pub dir: Mutex<Option<PathBuf>>,
    /// Error text returned by `clone_repo` when set.
    pub clone_error: Mutex<Option<String>>,
    /// Recorded `delete` calls as `(repo_full_name, pull_num)`.
    pub deletes: Mutex<Vec<(String, u64)>>,
}

impl MockWorkspace {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir: Mutex::new(dir),
            clone_error: Mutex::new(None),
            deletes: Mutex::new(Vec::new()),
        }
    }
}

impl Workspace for MockWorkspace {
    fn clone_repo(
        &self,
        _log: &RunLog,
        _base_repo: &Repo,
        _head_repo: &Repo,
        _pull: &PullRequest,
        _workspace: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        if let Some(message) = self.clone_error.lock().unwrap().clone() {
            return Err(WorkspaceError::CloneFailed {
                sanitized_url: "https://example.com/owner/repo.git".to_string(),
                output: message,
            });
        }
        self.dir
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| WorkspaceError::NotFound(PathBuf::from("/nowhere")))
    }

    fn get_workspace(
        &self,
        _repo: &Repo,
        _pull: &PullRequest,
        _workspace: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        self.dir
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| WorkspaceError::NotFound(PathBuf::from("/nowhere")))
    }

    fn delete(&self, repo: &Repo, pull: &PullRequest) -> Result<(), WorkspaceError> {
        self.deletes
            .lock()
            .unwrap()
            .push((repo.full_name.clone(), pull.num));
        Ok(())
    }
}

/// A context fixture for `owner/repo` pull `1`.
pub fn test_ctx(name: CommandName) -> CommandContext {
    let repo = Repo {
        host: HostType::Github,
        full_name: "owner/repo".to_string(),
        owner: "owner".to_string(),
        name: "repo".to_string(),
        clone_url: "https://u:p@github.com/owner/repo.git".to_string(),
        sanitized_clone_url: "https://github.com/owner/repo.git".to_string(),
    };
    CommandContext {
        base_repo: repo.clone(),
        head_repo: repo,
        pull: PullRequest {
            num: 1,
            branch: "feature".to_string(),
            head_commit: "abc123".to_string(),
            author: "lkysow".to_string(),
            url: "https://github.com/owner/repo/pull/1".to_string(),
            ..PullRequest::default()
        },
        user: User {
            username: "lkysow".to_string(),
        },
        command: Command::new(name),
        log: RunLog::new("owner/repo#1"),
    }
}
