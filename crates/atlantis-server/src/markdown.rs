//! Rendering command responses into review comments.
//!
//! The engine consumes the [`Renderer`] trait; [`MarkdownRenderer`] is
//! the stock implementation producing GitHub-flavoured markdown. With
//! `--verbose` the run log is appended in a collapsed details block.

use atlantis_core::models::CommandName;

use crate::events::{CommandResponse, ProjectResult};

/// Renders a command response into the comment body to post.
pub trait Renderer: Send + Sync {
    /// Renders `response` for a `command` run. `log` is the buffered run
    /// log, appended when `verbose` is set.
    fn render(
        &self,
        response: &CommandResponse,
        command: CommandName,
        log: &str,
        verbose: bool,
    ) -> String;
}

/// Stock markdown renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownRenderer;

fn title(command: CommandName) -> &'static str {
    match command {
        CommandName::Plan => "Plan",
        CommandName::Apply => "Apply",
        CommandName::Unlock => "Unlock",
        CommandName::Help => "Help",
    }
}

impl Renderer for MarkdownRenderer {
    fn render(
        &self,
        response: &CommandResponse,
        command: CommandName,
        log: &str,
        verbose: bool,
    ) -> String {
        let mut body = if let Some(error) = &response.error {
            format!("**{} Error**\n```\n{error}\n```\n\n", title(command))
        } else if !response.failure.is_empty() {
            format!("**{} Failed**: {}\n\n", title(command), response.failure)
        } else if command == CommandName::Unlock {
            "All Atlantis locks for this PR have been unlocked and plans discarded.\n\n"
                .to_string()
        } else {
            render_projects(&response.project_results, command)
        };

        if verbose {
            body.push_str(&format!(
                "<details><summary>Log</summary>\n  <p>\n\n```\n{log}```\n</p></details>\n"
            ));
        }
        body
    }
}

fn render_projects(results: &[ProjectResult], command: CommandName) -> String {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!(
            "Ran {} in dir: `{}` workspace: `{}`\n\n",
            title(command),
            result.path,
            result.workspace
        ));
        out.push_str(&render_project(result, command));
        out.push_str("\n---\n");
    }
    out
}

fn render_project(result: &ProjectResult, command: CommandName) -> String {
    if let Some(error) = &result.error {
        return format!("**{} Error**\n```\n{error}\n```\n", title(command));
    }
    if !result.failure.is_empty() {
        return format!("**{} Failed**: {}\n", title(command), result.failure);
    }
    if let Some(plan) = &result.plan_success {
        return format!(
            "```diff\n{}\n```\n\n* To **discard** this plan click [here]({})\n",
            plan.terraform_output, plan.lock_url
        );
    }
    format!("```diff\n{}\n```\n", result.apply_success)
}

#[cfg(test)]
mod tests {
    use crate::events::PlanSuccess;

    use super::*;

    #[test]
    fn renders_error() {
        let r = MarkdownRenderer;
        let s = r.render(&CommandResponse::error("err"), CommandName::Apply, "", false);
        assert_eq!(s, "**Apply Error**\n```\nerr\n```\n\n");
    }

    #[test]
    fn renders_failure() {
        let r = MarkdownRenderer;
        let s = r.render(&CommandResponse::failure("failure"), CommandName::Plan, "", false);
        assert_eq!(s, "**Plan Failed**: failure\n\n");
    }

    #[test]
    fn verbose_appends_log() {
        let r = MarkdownRenderer;
        let s = r.render(&CommandResponse::failure("failure"), CommandName::Plan, "log\n", true);
        assert!(s.starts_with("**Plan Failed**: failure\n\n"));
        assert!(s.contains("<details><summary>Log</summary>"));
        assert!(s.contains("log\n"));
    }

    #[test]
    fn renders_plan_success_with_lock_link() {
        let r = MarkdownRenderer;
        let response = CommandResponse::results(vec![ProjectResult {
            path: "dir".to_string(),
            workspace: "default".to_string(),
            plan_success: Some(PlanSuccess {
                terraform_output: "+ resource".to_string(),
                lock_url: "https://example.com/lock?id=key".to_string(),
            }),
            ..ProjectResult::default()
        }]);
        let s = r.render(&response, CommandName::Plan, "", false);
        assert!(s.contains("Ran Plan in dir: `dir` workspace: `default`"));
        assert!(s.contains("```diff\n+ resource\n```"));
        assert!(s.contains("https://example.com/lock?id=key"));
    }

    #[test]
    fn renders_unlock_confirmation() {
        let r = MarkdownRenderer;
        let s = r.render(&CommandResponse::default(), CommandName::Unlock, "", false);
        assert!(s.contains("unlocked"));
    }
}
