//! The apply executor.
//!
//! Locates the plan artifacts written by earlier plans, optionally gates
//! on PR approval, runs `terraform apply` per artifact and releases the
//! project lock on success. Every apply attempt emits an [`ApplyResult`]
//! notification, success or not.
//!
//! [`ApplyResult`]: crate::webhooks::ApplyResult

use std::path::{Path, PathBuf};
use std::sync::Arc;

use atlantis_core::hooks::HookRunner;
use atlantis_core::locking::Locker;
use atlantis_core::models::Project;
use atlantis_core::terraform::TerraformRunner;
use walkdir::WalkDir;

use crate::events::pre_executor::{project_abs_dir, PreExecuteResult, PreExecutor};
use crate::events::workspace::Workspace;
use crate::events::{command_env, CommandContext, CommandResponse, Executor, ProjectResult};
use crate::vcs::VcsClient;
use crate::webhooks::{ApplyResult, Sender};

/// Runs `terraform apply` against the plans in a PR's workspace.
#[derive(Clone)]
pub struct ApplyExecutor {
    /// VCS capability for the approval check.
    pub vcs: Arc<dyn VcsClient>,
    /// Terraform client.
    pub terraform: Arc<dyn TerraformRunner>,
    /// Whether applies require an approved PR.
    pub require_approval: bool,
    /// Clone tree manager.
    pub workspace: Arc<dyn Workspace>,
    /// Per-project setup (reacquires the lock when needed).
    pub pre_executor: Arc<dyn PreExecutor>,
    /// Lock service, released per project on apply success.
    pub locker: Locker,
    /// Apply-result notifier.
    pub webhooks: Arc<dyn Sender>,
}

impl Executor for ApplyExecutor {
    fn execute(&self, ctx: &CommandContext) -> CommandResponse {
        if self.require_approval {
            match self.vcs.pull_is_approved(&ctx.base_repo, &ctx.pull) {
                Ok(true) => ctx.log.info("confirmed pull request was approved"),
                Ok(false) => {
                    return CommandResponse::failure(
                        "Pull request must be approved before running apply.",
                    );
                }
                Err(e) => {
                    return CommandResponse::error(format!(
                        "checking if pull request was approved: {e}"
                    ));
                }
            }
        }

        let repo_dir = match self.workspace.get_workspace(
            &ctx.base_repo,
            &ctx.pull,
            &ctx.command.workspace,
        ) {
            Ok(dir) => dir,
            Err(_) => {
                return CommandResponse::failure("No workspace found. Did you run plan?");
            }
        };
        ctx.log.info(format!("found workspace in {repo_dir:?}"));

        let plans = match self.collect_plans(ctx, &repo_dir) {
            Ok(plans) => plans,
            Err(response) => return *response,
        };
        if plans.is_empty() {
            return CommandResponse::failure("No plans found for that workspace.");
        }
        ctx.log.info(format!("found {} plan(s) in our workspace", plans.len()));

        let mut results = Vec::new();
        for (project, plan_path) in &plans {
            ctx.log
                .info(format!("running apply for project at path {:?}", project.path));
            let mut result = self.apply(ctx, &repo_dir, project, plan_path);
            result.path.clone_from(&project.path);
            result.workspace.clone_from(&ctx.command.workspace);
            results.push(result);
        }
        CommandResponse::results(results)
    }
}

impl ApplyExecutor {
    /// Finds the plan artifacts to apply, ordered by project path.
    ///
    /// Without `-d` the whole workspace tree is walked for files named
    /// `{workspace}.tfplan`; with `-d` exactly that directory's plan
    /// must exist.
    fn collect_plans(
        &self,
        ctx: &CommandContext,
        repo_dir: &Path,
    ) -> Result<Vec<(Project, PathBuf)>, Box<CommandResponse>> {
        let plan_name = format!("{}.tfplan", ctx.command.workspace);
        let mut plans = Vec::new();

        if ctx.command.dir.is_empty() {
            for entry in WalkDir::new(repo_dir) {
                let entry = entry.map_err(|e| {
                    Box::new(CommandResponse::error(format!("finding plans: {e}")))
                })?;
                if entry.file_type().is_file() && entry.file_name().to_string_lossy() == plan_name
                {
                    let rel_dir = entry
                        .path()
                        .parent()
                        .and_then(|p| p.strip_prefix(repo_dir).ok())
                        .map_or_else(String::new, |p| p.to_string_lossy().into_owned());
                    plans.push((
                        Project::new(&ctx.base_repo.full_name, &rel_dir),
                        entry.path().to_path_buf(),
                    ));
                }
            }
            plans.sort_by(|a, b| a.0.path.cmp(&b.0.path));
        } else {
            let plan_path = repo_dir.join(&ctx.command.dir).join(&plan_name);
            if !plan_path.is_file() {
                return Err(Box::new(CommandResponse::error(format!(
                    "no plan found at path {:?} and workspace {:?}–did you run plan?",
                    ctx.command.dir, ctx.command.workspace
                ))));
            }
            plans.push((
                Project::new(&ctx.base_repo.full_name, &ctx.command.dir),
                plan_path,
            ));
        }
        Ok(plans)
    }

    /// Applies a single plan artifact.
    fn apply(
        &self,
        ctx: &CommandContext,
        repo_dir: &Path,
        project: &Project,
        plan_path: &Path,
    ) -> ProjectResult {
        let ready = match self.pre_executor.execute(ctx, repo_dir, project) {
            PreExecuteResult::Failed(result) => return result,
            PreExecuteResult::Ready(ready) => ready,
        };
        let workspace = &ctx.command.workspace;
        let abs_dir = project_abs_dir(repo_dir, project);

        let mut args: Vec<String> = vec!["apply".to_string(), "-no-color".to_string()];
        args.extend(ready.config.extra_arguments("apply"));
        args.extend(ctx.command.flags.iter().cloned());
        args.push(plan_path.display().to_string());

        let env = command_env(ctx, &abs_dir, workspace, &ready.terraform_version);
        let run = self.terraform.run_command_with_version(
            &ctx.log,
            &abs_dir,
            &args,
            Some(&ready.terraform_version),
            workspace,
            &env,
        );

        self.webhooks.send(&ApplyResult {
            workspace: workspace.clone(),
            user: ctx.user.clone(),
            repo: ctx.base_repo.clone(),
            pull: ctx.pull.clone(),
            success: run.is_ok(),
        });

        let output = match run {
            Ok(output) => output,
            Err(e) => {
                return ProjectResult {
                    error: Some(e.to_string()),
                    ..ProjectResult::default()
                };
            }
        };
        ctx.log.info("apply succeeded");

        // The plan-apply cycle for this project is complete.
        if let Err(e) = self.locker.unlock(&ready.lock_response.lock_key) {
            ctx.log.err(format!("unlocking after apply: {e}"));
        }

        if let Err(e) =
            HookRunner::execute(&ctx.log, &ready.config.post_apply, &abs_dir, &env, "post_apply")
        {
            return ProjectResult {
                error: Some(format!("running post apply commands: {e}")),
                ..ProjectResult::default()
            };
        }

        ProjectResult {
            apply_success: output,
            ..ProjectResult::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use atlantis_core::models::{CommandName, User};
    use tempfile::TempDir;

    use super::*;
    use crate::events::pre_executor::test_support::MockPreExecutor;
    use crate::events::test_doubles::{test_ctx, InMemoryLockStore, MockTerraform, MockWorkspace};
    use crate::vcs::MockVcsClient;
    use crate::webhooks::RecordingSender;

    struct Setup {
        executor: ApplyExecutor,
        vcs: Arc<MockVcsClient>,
        terraform: Arc<MockTerraform>,
        store: Arc<InMemoryLockStore>,
        webhooks: Arc<RecordingSender>,
        workspace_dir: TempDir,
    }

    fn setup(require_approval: bool) -> Setup {
        let vcs = Arc::new(MockVcsClient::new());
        let terraform = Arc::new(MockTerraform::new("0.11.10"));
        let store = Arc::new(InMemoryLockStore::new());
        let webhooks = Arc::new(RecordingSender::new());
        let workspace_dir = TempDir::new().unwrap();
        let executor = ApplyExecutor {
            vcs: vcs.clone(),
            terraform: terraform.clone(),
            require_approval,
            workspace: Arc::new(MockWorkspace::new(Some(workspace_dir.path().to_path_buf()))),
            pre_executor: Arc::new(MockPreExecutor::new()),
            locker: Locker::new(store.clone()),
            webhooks: webhooks.clone(),
        };
        Setup {
            executor,
            vcs,
            terraform,
            store,
            webhooks,
            workspace_dir,
        }
    }

    fn write_plan(root: &Path, rel_dir: &str, workspace: &str) -> PathBuf {
        let dir = if rel_dir.is_empty() {
            root.to_path_buf()
        } else {
            let dir = root.join(rel_dir);
            std::fs::create_dir_all(&dir).unwrap();
            dir
        };
        let path = dir.join(format!("{workspace}.tfplan"));
        std::fs::write(&path, b"plan").unwrap();
        path
    }

    #[test]
    fn unapproved_pull_is_a_failure() {
        let s = setup(true);
        s.vcs.set_approved(Ok(false));
        let response = s.executor.execute(&test_ctx(CommandName::Apply));
        assert_eq!(
            response.failure,
            "Pull request must be approved before running apply."
        );
    }

    #[test]
    fn approval_check_error_is_fatal() {
        let s = setup(true);
        s.vcs.set_approved(Err("boom".to_string()));
        let response = s.executor.execute(&test_ctx(CommandName::Apply));
        assert_eq!(
            response.error.as_deref(),
            Some("checking if pull request was approved: boom")
        );
    }

    #[test]
    fn missing_workspace_is_a_failure() {
        let s = setup(false);
        let executor = ApplyExecutor {
            workspace: Arc::new(MockWorkspace::new(None)),
            ..s.executor
        };
        let response = executor.execute(&test_ctx(CommandName::Apply));
        assert_eq!(response.failure, "No workspace found. Did you run plan?");
    }

    #[test]
    fn no_plans_is_a_failure() {
        let s = setup(false);
        let response = s.executor.execute(&test_ctx(CommandName::Apply));
        assert_eq!(response.failure, "No plans found for that workspace.");
    }

    #[test]
    fn walk_finds_plans_for_the_workspace_only() {
        let s = setup(false);
        s.terraform.set_output("Apply complete!");
        write_plan(s.workspace_dir.path(), "", "default");
        write_plan(s.workspace_dir.path(), "b", "default");
        write_plan(s.workspace_dir.path(), "a", "staging");

        let response = s.executor.execute(&test_ctx(CommandName::Apply));
        let paths: Vec<&str> = response
            .project_results
            .iter()
            .map(|r| r.path.as_str())
            .collect();
        // Ordered by project path; the staging plan is skipped.
        assert_eq!(paths, vec![".", "b"]);
        assert!(response
            .project_results
            .iter()
            .all(|r| !r.apply_success.is_empty()));
    }

    #[test]
    fn explicit_dir_requires_its_plan() {
        let s = setup(false);
        let mut ctx = test_ctx(CommandName::Apply);
        ctx.command.dir = "missing".to_string();
        let response = s.executor.execute(&ctx);
        assert_eq!(
            response.error.as_deref(),
            Some("no plan found at path \"missing\" and workspace \"default\"–did you run plan?")
        );
    }

    #[test]
    fn explicit_dir_applies_that_plan() {
        let s = setup(false);
        let plan_path = write_plan(s.workspace_dir.path(), "dir1", "default");
        let mut ctx = test_ctx(CommandName::Apply);
        ctx.command.dir = "dir1".to_string();

        let response = s.executor.execute(&ctx);
        assert_eq!(response.project_results.len(), 1);
        let call = &s.terraform.calls_for("apply")[0];
        assert_eq!(
            call.args,
            vec![
                "apply".to_string(),
                "-no-color".to_string(),
                plan_path.display().to_string(),
            ]
        );
    }

    #[test]
    fn success_unlocks_and_notifies() {
        let s = setup(false);
        write_plan(s.workspace_dir.path(), "", "default");
        let ctx = test_ctx(CommandName::Apply);

        // The lock exists from the plan phase.
        let project = Project::new("owner/repo", ".");
        s.executor
            .locker
            .try_lock(&project, "default", &ctx.pull, &User::default())
            .unwrap();

        let response = s.executor.execute(&ctx);
        assert!(response.project_results[0].error.is_none());
        assert!(s.store.keys().is_empty(), "lock should be released");

        let sent = s.webhooks.results();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].success);
        assert_eq!(sent[0].workspace, "default");
        assert_eq!(sent[0].pull.num, 1);
    }

    #[test]
    fn failed_apply_keeps_the_lock_and_notifies_failure() {
        let s = setup(false);
        write_plan(s.workspace_dir.path(), "", "default");
        s.terraform.fail_on("apply", "apply blew up");
        let ctx = test_ctx(CommandName::Apply);

        let project = Project::new("owner/repo", ".");
        s.executor
            .locker
            .try_lock(&project, "default", &ctx.pull, &User::default())
            .unwrap();

        let response = s.executor.execute(&ctx);
        let error = response.project_results[0].error.as_deref().unwrap();
        assert!(error.contains("apply blew up"), "{error}");
        assert_eq!(s.store.keys(), vec!["owner/repo//default"]);

        let sent = s.webhooks.results();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].success);
    }
}
