//! The plan executor.
//!
//! For each modified project (or the single `-d` directory): pre-execute,
//! run `terraform plan` writing the artifact to
//! `{cloneRoot}/{project}/{workspace}.tfplan`, then run `post_plan`
//! hooks. A failing project releases its lock and does not abort the
//! remaining projects.

use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use atlantis_core::locking::Locker;
use atlantis_core::models::Project;
use atlantis_core::projects::ProjectFinder;
use atlantis_core::terraform::TerraformRunner;
use atlantis_core::hooks::HookRunner;
use regex::Regex;

use crate::events::pre_executor::{project_abs_dir, PreExecuteResult, PreExecutor};
use crate::events::workspace::Workspace;
use crate::events::{command_env, CommandContext, CommandResponse, Executor, PlanSuccess, ProjectResult};
use crate::lock_url::LockUrlBuilder;
use crate::vcs::VcsClient;

/// Separator terraform prints after the refresh preamble.
fn refresh_separator() -> String {
    format!("{}\n", "-".repeat(72))
}

/// Runs `terraform plan` across the PR's modified projects.
#[derive(Clone)]
pub struct PlanExecutor {
    /// VCS capability for the modified-file list.
    pub vcs: Arc<dyn VcsClient>,
    /// Terraform client.
    pub terraform: Arc<dyn TerraformRunner>,
    /// Lock service, for releasing locks of failed plans.
    pub locker: Locker,
    /// Clone tree manager.
    pub workspace: Arc<dyn Workspace>,
    /// Per-project setup.
    pub pre_executor: Arc<dyn PreExecutor>,
    /// Builder for the lock detail links in plan comments.
    pub lock_urls: LockUrlBuilder,
}

impl Executor for PlanExecutor {
    fn execute(&self, ctx: &CommandContext) -> CommandResponse {
        let modified_files = match self.vcs.get_modified_files(&ctx.base_repo, &ctx.pull) {
            Ok(files) => files,
            Err(e) => return CommandResponse::error(format!("getting modified files: {e}")),
        };
        ctx.log
            .debug(format!("{} files were modified in this pull request", modified_files.len()));

        // An explicit -d wins even when nothing under it was modified.
        let projects = if ctx.command.dir.is_empty() {
            let projects =
                ProjectFinder::determine_projects(&modified_files, &ctx.base_repo.full_name);
            if projects.is_empty() {
                return CommandResponse::failure("No Terraform files were modified.");
            }
            projects
        } else {
            vec![Project::new(&ctx.base_repo.full_name, &ctx.command.dir)]
        };

        let repo_dir = match self.workspace.clone_repo(
            &ctx.log,
            &ctx.base_repo,
            &ctx.head_repo,
            &ctx.pull,
            &ctx.command.workspace,
        ) {
            Ok(dir) => dir,
            Err(e) => return CommandResponse::error(e.to_string()),
        };

        let mut results = Vec::new();
        for project in &projects {
            ctx.log
                .info(format!("running plan for project at path {:?}", project.path));
            let mut result = self.plan(ctx, &repo_dir, project);
            result.path.clone_from(&project.path);
            result.workspace.clone_from(&ctx.command.workspace);
            results.push(result);
        }
        CommandResponse::results(results)
    }
}

impl PlanExecutor {
    /// Plans a single project. The returned result has `path` and
    /// `workspace` filled in by the caller.
    fn plan(&self, ctx: &CommandContext, repo_dir: &Path, project: &Project) -> ProjectResult {
        let ready = match self.pre_executor.execute(ctx, repo_dir, project) {
            PreExecuteResult::Failed(result) => return result,
            PreExecuteResult::Ready(ready) => ready,
        };
        let workspace = &ctx.command.workspace;
        let abs_dir = project_abs_dir(repo_dir, project);
        let plan_file = abs_dir.join(format!("{workspace}.tfplan"));

        let mut args: Vec<String> = vec![
            "plan".to_string(),
            "-refresh".to_string(),
            "-no-color".to_string(),
            "-out".to_string(),
            plan_file.display().to_string(),
            "-var".to_string(),
            format!("atlantis_user={}", ctx.user.username),
        ];
        // An env/{workspace}.tfvars file is included before any extra
        // arguments so those can still override it.
        let env_file_rel = format!("env/{workspace}.tfvars");
        if abs_dir.join(&env_file_rel).is_file() {
            args.push("-var-file".to_string());
            args.push(env_file_rel);
        }
        args.extend(ready.config.extra_arguments("plan"));
        args.extend(ctx.command.flags.iter().cloned());

        let env = command_env(ctx, &abs_dir, workspace, &ready.terraform_version);
        let output = match self.terraform.run_command_with_version(
            &ctx.log,
            &abs_dir,
            &args,
            Some(&ready.terraform_version),
            workspace,
            &env,
        ) {
            Ok(output) => output,
            Err(e) => {
                // The plan never materialised; release the lock so other
                // PRs aren't blocked by a broken project.
                if let Err(unlock_err) = self.locker.unlock(&ready.lock_response.lock_key) {
                    ctx.log.err(format!("unlocking after failed plan: {unlock_err}"));
                }
                return ProjectResult {
                    error: Some(e.to_string()),
                    ..ProjectResult::default()
                };
            }
        };

        if let Err(e) =
            HookRunner::execute(&ctx.log, &ready.config.post_plan, &abs_dir, &env, "post_plan")
        {
            return ProjectResult {
                error: Some(format!("running post plan commands: {e}")),
                ..ProjectResult::default()
            };
        }

        ProjectResult {
            plan_success: Some(PlanSuccess {
                terraform_output: fmt_plan_output(&output),
                lock_url: self.lock_urls.build(&ready.lock_response.lock_key),
            }),
            ..ProjectResult::default()
        }
    }
}

/// Post-processes plan output for display: drops the `Refreshing...`
/// preamble and outdents diff markers so comment syntax highlighting
/// colours them. The artifact on disk is untouched.
fn fmt_plan_output(output: &str) -> String {
    static PLUS: OnceLock<Regex> = OnceLock::new();
    static TILDE: OnceLock<Regex> = OnceLock::new();
    static MINUS: OnceLock<Regex> = OnceLock::new();
    let plus = PLUS.get_or_init(|| Regex::new(r"(?m)^ {2}\+").expect("static regex"));
    let tilde = TILDE.get_or_init(|| Regex::new(r"(?m)^ {2}~").expect("static regex"));
    let minus = MINUS.get_or_init(|| Regex::new(r"(?m)^ {2}-").expect("static regex"));

    let separator = refresh_separator();
    let trimmed = output
        .find(&separator)
        .map_or(output, |i| &output[i + separator.len()..]);

    let out = plus.replace_all(trimmed, "+");
    let out = tilde.replace_all(&out, "~");
    minus.replace_all(&out, "-").into_owned()
}
