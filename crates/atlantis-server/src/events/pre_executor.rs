//! Per-project setup before plan or apply.
//!
//! Steps, each short-circuiting on failure: load the project config,
//! resolve the terraform version, acquire the project lock, then run
//! `init`/`get` (version-dependent) with the configured pre-hooks first
//! and select the terraform workspace. Any failure after the lock was
//! acquired releases it before returning, so a failed project never
//! leaves a dangling lock.
//!
//! Lock acquisition is re-entrant per pull request: finding our own
//! lock already in place counts as success, so replanning the same
//! project doesn't contend with itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atlantis_core::config::ProjectConfig;
use atlantis_core::hooks::HookRunner;
use atlantis_core::locking::{Locker, TryLockResponse};
use atlantis_core::models::{Project, DEFAULT_WORKSPACE};
use atlantis_core::terraform::{uses_env_command, uses_init, TerraformRunner};

use crate::events::{command_env, CommandContext, ProjectResult};
use crate::lock_url::LockUrlBuilder;

/// A project that passed pre-execution and is ready for plan/apply.
#[derive(Clone)]
pub struct ReadyProject {
    /// The project's config (default when no file exists).
    pub config: ProjectConfig,
    /// Resolved terraform version for this project.
    pub terraform_version: String,
    /// The acquired (or re-entered) lock.
    pub lock_response: TryLockResponse,
}

/// Outcome of pre-execution.
#[derive(Clone)]
pub enum PreExecuteResult {
    /// Setup failed; the result describes why. Any acquired lock has
    /// been released.
    Failed(ProjectResult),
    /// Setup succeeded; the lock is held.
    Ready(ReadyProject),
}

/// Runs pre-execution for one project.
pub trait PreExecutor: Send + Sync {
    /// Prepares `project` inside the clone at `repo_dir`.
    fn execute(&self, ctx: &CommandContext, repo_dir: &Path, project: &Project)
        -> PreExecuteResult;
}

/// The production pre-executor.
#[derive(Clone)]
pub struct ProjectPreExecutor {
    /// Lock service.
    pub locker: Locker,
    /// Terraform client.
    pub terraform: Arc<dyn TerraformRunner>,
    /// Builder for lock detail URLs in contention messages.
    pub lock_urls: LockUrlBuilder,
}

/// Absolute directory of a project inside the clone root.
pub(crate) fn project_abs_dir(repo_dir: &Path, project: &Project) -> PathBuf {
    if project.path == "." {
        repo_dir.to_path_buf()
    } else {
        repo_dir.join(&project.path)
    }
}

impl ProjectPreExecutor {
    fn error_result(message: impl Into<String>) -> PreExecuteResult {
        PreExecuteResult::Failed(ProjectResult {
            error: Some(message.into()),
            ..ProjectResult::default()
        })
    }

    /// Runs hooks, init/get and workspace selection. Returns the
    /// user-facing error message on failure.
    fn run_setup(
        &self,
        ctx: &CommandContext,
        abs_dir: &Path,
        config: &ProjectConfig,
        version: &str,
        env: &[(String, String)],
    ) -> Result<(), String> {
        let workspace = &ctx.command.workspace;

        if uses_init(version) {
            HookRunner::execute(&ctx.log, &config.pre_init, abs_dir, env, "pre_init")
                .map_err(|e| e.to_string())?;
            let mut args = vec!["init".to_string(), "-no-color".to_string()];
            args.extend(config.extra_arguments("init"));
            self.terraform
                .run_command_with_version(&ctx.log, abs_dir, &args, Some(version), workspace, env)
                .map_err(|e| e.to_string())?;
        } else {
            if workspace != DEFAULT_WORKSPACE {
                return Err(format!(
                    "terraform version {version} does not support workspaces"
                ));
            }
            HookRunner::execute(&ctx.log, &config.pre_get, abs_dir, env, "pre_get")
                .map_err(|e| e.to_string())?;
            let mut args = vec!["get".to_string(), "-no-color".to_string()];
            args.extend(config.extra_arguments("get"));
            self.terraform
                .run_command_with_version(&ctx.log, abs_dir, &args, Some(version), workspace, env)
                .map_err(|e| e.to_string())?;
            return Ok(());
        }

        // Select the terraform workspace, creating it on first use. The
        // command was named `env` in 0.9.x.
        let command_word = if uses_env_command(version) { "env" } else { "workspace" };
        let select = vec![
            command_word.to_string(),
            "select".to_string(),
            "-no-color".to_string(),
            workspace.clone(),
        ];
        if self
            .terraform
            .run_command_with_version(&ctx.log, abs_dir, &select, Some(version), workspace, env)
            .is_err()
        {
            let new = vec![
                command_word.to_string(),
                "new".to_string(),
                "-no-color".to_string(),
                workspace.clone(),
            ];
            self.terraform
                .run_command_with_version(&ctx.log, abs_dir, &new, Some(version), workspace, env)
                .map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl PreExecutor for ProjectPreExecutor {
    fn execute(
        &self,
        ctx: &CommandContext,
        repo_dir: &Path,
        project: &Project,
    ) -> PreExecuteResult {
        let workspace = &ctx.command.workspace;
        let abs_dir = project_abs_dir(repo_dir, project);

        let config = match ProjectConfig::read(&abs_dir) {
            Ok(config) => config,
            Err(e) => return Self::error_result(e.to_string()),
        };

        let version = config
            .terraform_version
            .clone()
            .unwrap_or_else(|| self.terraform.default_version().to_string());
        if !self.terraform.version_installed(&version) {
            return Self::error_result(format!(
                "terraform version {version} is not installed (expected a terraform{version} \
                 binary on $PATH)"
            ));
        }

        let lock_response = match self.locker.try_lock(project, workspace, &ctx.pull, &ctx.user)
        {
            Ok(response) => response,
            Err(e) => return Self::error_result(e.to_string()),
        };
        if !lock_response.lock_acquired && lock_response.curr_lock.pull.num != ctx.pull.num {
            let lock_url = self.lock_urls.build(&lock_response.lock_key);
            return PreExecuteResult::Failed(ProjectResult {
                failure: format!(
                    "The {workspace} workspace is currently locked by another command for pull \
                     #{}. The locking plan must be applied or discarded before future plans can \
                     execute: {lock_url}",
                    lock_response.curr_lock.pull.num
                ),
                ..ProjectResult::default()
            });
        }
        ctx.log.info(format!(
            "acquired lock {:?} for project {:?}",
            lock_response.lock_key, project.path
        ));

        let env = command_env(ctx, &abs_dir, workspace, &version);
        if let Err(message) = self.run_setup(ctx, &abs_dir, &config, &version, &env) {
            // Don't hold the lock for a project that never got set up.
            if let Err(e) = self.locker.unlock(&lock_response.lock_key) {
                ctx.log.err(format!("unlocking after failed setup: {e}"));
            }
            return Self::error_result(message);
        }

        PreExecuteResult::Ready(ReadyProject {
            config,
            terraform_version: version,
            lock_response,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atlantis_core::models::CommandName;
    use tempfile::TempDir;

    use super::*;
    use crate::events::test_doubles::{test_ctx, InMemoryLockStore, MockTerraform};

    struct Setup {
        pre: ProjectPreExecutor,
        terraform: Arc<MockTerraform>,
        store: Arc<InMemoryLockStore>,
        repo_dir: TempDir,
    }

    fn setup() -> Setup {
        let terraform = Arc::new(MockTerraform::new("0.11.10"));
        let store = Arc::new(InMemoryLockStore::new());
        let pre = ProjectPreExecutor {
            locker: Locker::new(store.clone()),
            terraform: terraform.clone(),
            lock_urls: LockUrlBuilder::new("https://atlantis.example.com"),
        };
        Setup {
            pre,
            terraform,
            store,
            repo_dir: TempDir::new().unwrap(),
        }
    }

    #[test]
    fn ready_acquires_the_lock_and_runs_init() {
        let s = setup();
        let ctx = test_ctx(CommandName::Plan);
        let project = Project::new("owner/repo", ".");

        let result = s.pre.execute(&ctx, s.repo_dir.path(), &project);
        let ready = match result {
            PreExecuteResult::Ready(ready) => ready,
            PreExecuteResult::Failed(r) => panic!("expected ready, got {r:?}"),
        };
        assert_eq!(ready.terraform_version, "0.11.10");
        assert_eq!(ready.lock_response.lock_key, "owner/repo//default");
        assert_eq!(s.store.keys(), vec!["owner/repo//default"]);

        let subcommands: Vec<String> = s
            .terraform
            .calls()
            .iter()
            .map(|c| c.args[0].clone())
            .collect();
        assert_eq!(subcommands, vec!["init", "workspace"]);
    }

    #[test]
    fn lock_held_by_another_pull_is_a_failure_with_link() {
        let s = setup();
        let project = Project::new("owner/repo", ".");
        let mut other = test_ctx(CommandName::Plan);
        other.pull.num = 9;
        s.pre
            .locker
            .try_lock(&project, "default", &other.pull, &other.user)
            .unwrap();

        let ctx = test_ctx(CommandName::Plan);
        match s.pre.execute(&ctx, s.repo_dir.path(), &project) {
            PreExecuteResult::Failed(result) => {
                assert!(
                    result.failure.starts_with(
                        "The default workspace is currently locked by another command for \
                         pull #9."
                    ),
                    "{}",
                    result.failure
                );
                assert!(
                    result
                        .failure
                        .contains("/lock?id=owner%2Frepo%2F%2Fdefault"),
                    "{}",
                    result.failure
                );
            }
            PreExecuteResult::Ready(_) => panic!("expected failure"),
        }
        // No terraform ran for the contended project.
        assert!(s.terraform.calls().is_empty());
    }

    #[test]
    fn lock_held_by_the_same_pull_is_reentrant() {
        let s = setup();
        let project = Project::new("owner/repo", ".");
        let ctx = test_ctx(CommandName::Plan);
        s.pre
            .locker
            .try_lock(&project, "default", &ctx.pull, &ctx.user)
            .unwrap();

        assert!(matches!(
            s.pre.execute(&ctx, s.repo_dir.path(), &project),
            PreExecuteResult::Ready(_)
        ));
    }

    #[test]
    fn missing_pinned_version_aborts() {
        let s = setup();
        std::fs::write(
            s.repo_dir.path().join("atlantis.yaml"),
            "terraform_version: 0.8.2\n",
        )
        .unwrap();
        let ctx = test_ctx(CommandName::Plan);
        let project = Project::new("owner/repo", ".");

        match s.pre.execute(&ctx, s.repo_dir.path(), &project) {
            PreExecuteResult::Failed(result) => {
                let error = result.error.unwrap();
                assert!(error.contains("0.8.2"), "{error}");
                assert!(error.contains("not installed"), "{error}");
            }
            PreExecuteResult::Ready(_) => panic!("expected failure"),
        }
        // Nothing was locked.
        assert!(s.store.keys().is_empty());
    }

    #[test]
    fn pinned_version_selects_get_for_old_terraform() {
        let s = setup();
        s.terraform.installed.lock().unwrap().insert("0.8.2".to_string());
        std::fs::write(
            s.repo_dir.path().join("atlantis.yaml"),
            "terraform_version: 0.8.2\n",
        )
        .unwrap();
        let ctx = test_ctx(CommandName::Plan);
        let project = Project::new("owner/repo", ".");

        assert!(matches!(
            s.pre.execute(&ctx, s.repo_dir.path(), &project),
            PreExecuteResult::Ready(_)
        ));
        let calls = s.terraform.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args[0], "get");
        assert_eq!(calls[0].version.as_deref(), Some("0.8.2"));
    }

    #[test]
    fn failed_init_releases_the_lock() {
        let s = setup();
        s.terraform.fail_on("init", "init exploded");
        let ctx = test_ctx(CommandName::Plan);
        let project = Project::new("owner/repo", ".");

        match s.pre.execute(&ctx, s.repo_dir.path(), &project) {
            PreExecuteResult::Failed(result) => {
                assert!(result.error.unwrap().contains("init exploded"));
            }
            PreExecuteResult::Ready(_) => panic!("expected failure"),
        }
        assert!(s.store.keys().is_empty(), "lock must be released");
    }

    #[test]
    fn workspace_is_created_when_select_fails() {
        let s = setup();
        s.terraform.fail_on("workspace", "doesn't exist");
        let ctx = test_ctx(CommandName::Plan);
        let project = Project::new("owner/repo", ".");

        // `workspace select` and `workspace new` both report through the
        // same subcommand, so this setup fails both and the lock is
        // released.
        match s.pre.execute(&ctx, s.repo_dir.path(), &project) {
            PreExecuteResult::Failed(result) => {
                assert!(result.error.is_some());
            }
            PreExecuteResult::Ready(_) => panic!("expected failure"),
        }
        let workspace_calls = s.terraform.calls_for("workspace");
        assert_eq!(workspace_calls.len(), 2);
        assert_eq!(workspace_calls[0].args[1], "select");
        assert_eq!(workspace_calls[1].args[1], "new");
        assert!(s.store.keys().is_empty());
    }
}
