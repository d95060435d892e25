//! Comment parsing: free-text PR comments into typed commands.
//!
//! The parser is a pure function from `(comment, host)` to a
//! [`CommentParseResult`]. It never touches the filesystem or network, so
//! the webhook ingress can call it before any policy checks run.
//!
//! Rules, evaluated in order:
//!
//! 1. empty, single-token or multi-line comments are ignored
//! 2. a comment starting with `terraform` gets a did-you-mean response
//! 3. a comment not addressed to `atlantis` (or the bot user) is ignored
//! 4. `help`, `-h`, `--help` render usage
//! 5. anything but `plan`, `apply`, `unlock` is an unknown command
//! 6. remaining tokens are parsed with a POSIX-style flag grammar; tokens
//!    after `--` are collected verbatim and shell-quoted

use clap::{Arg, ArgAction};
use regex::Regex;
use std::sync::OnceLock;

use crate::models::{Command, CommandName, HostType, DEFAULT_WORKSPACE};

/// The executable name comments must address.
const ATLANTIS_EXECUTABLE: &str = "atlantis";

/// The tool name that triggers a did-you-mean response.
const TERRAFORM_EXECUTABLE: &str = "terraform";

/// Response posted when someone addresses terraform directly.
pub const DID_YOU_MEAN_ATLANTIS: &str =
    "Did you mean to use `atlantis` instead of `terraform`?";

/// Response posted for `atlantis help`.
pub const HELP_COMMENT: &str = "```cmake
atlantis - Terraform automation for pull requests

Usage:
  atlantis <command> [flags] [-- extra terraform args]

Commands:
  plan    Runs 'terraform plan' for the changes in this pull request.
  apply   Runs 'terraform apply' for the plans generated by this pull request.
  unlock  Releases every lock held by this pull request.
  help    View help.

Flags:
  -h, --help   help for atlantis

Use \"atlantis [command] --help\" for more information about a command.
```";

/// Usage banner for `atlantis plan`.
pub const PLAN_USAGE: &str = "Usage of plan:
  -d, --dir string         Which directory to run plan in relative to root of repo.
                           Use '.' for root. If not specified, will attempt to run
                           plan for all Terraform projects we think were modified in
                           this changeset.
      --verbose            Append Atlantis log to comment.
  -w, --workspace string   Switch to this Terraform workspace before planning.
                           (default \"default\")
";

/// Usage banner for `atlantis apply`.
pub const APPLY_USAGE: &str = "Usage of apply:
  -d, --dir string         Apply the plan for this directory, relative to root of
                           repo. Use '.' for root. If not specified, will run apply
                           against all plans created for this workspace.
      --verbose            Append Atlantis log to comment.
  -w, --workspace string   Apply the plan for this Terraform workspace. (default
                           \"default\")
";

/// Usage banner for `atlantis unlock`.
pub const UNLOCK_USAGE: &str = "Usage of unlock:
  Takes no flags. Releases every lock held by this pull request and
  discards its plans.
";

/// Outcome of parsing a comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommentParseResult {
    /// Not addressed to us; do nothing.
    Ignore,
    /// Usage requested; the string is the comment to post.
    Help(String),
    /// The comment addressed terraform directly.
    DidYouMean(String),
    /// The comment addressed us but didn't parse; the string is the
    /// user-facing error comment.
    ParseError(String),
    /// A fully parsed command ready for the handler.
    Command(Command),
}

impl CommentParseResult {
    /// The comment to post back, if this result is a response rather than
    /// a command.
    #[must_use]
    pub fn response_text(&self) -> Option<&str> {
        match self {
            Self::Help(s) | Self::DidYouMean(s) | Self::ParseError(s) => Some(s),
            Self::Ignore | Self::Command(_) => None,
        }
    }
}

/// Parses PR comments into commands.
///
/// One parser instance is shared across all events; the per-host bot
/// usernames let `@bot plan` work as an alias for `atlantis plan`.
#[derive(Debug, Clone, Default)]
pub struct CommentParser {
    /// Bot username on GitHub.
    pub github_user: String,
    /// Bot username on GitLab.
    pub gitlab_user: String,
    /// Bot username on Bitbucket (cloud and server).
    pub bitbucket_user: String,
    /// Bot username on Azure DevOps.
    pub azuredevops_user: String,
}

fn multi_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r".*\r?\n.+").expect("static regex"))
}

impl CommentParser {
    fn bot_user(&self, host: HostType) -> &str {
        match host {
            HostType::Github => &self.github_user,
            HostType::Gitlab => &self.gitlab_user,
            HostType::BitbucketCloud | HostType::BitbucketServer => &self.bitbucket_user,
            HostType::AzureDevops => &self.azuredevops_user,
        }
    }

    /// Parses a raw comment into a [`CommentParseResult`].
    #[must_use]
    pub fn parse(&self, comment: &str, host: HostType) -> CommentParseResult {
        if multi_line_regex().is_match(comment) {
            return CommentParseResult::Ignore;
        }

        let tokens: Vec<&str> = comment.split_whitespace().collect();
        if tokens.len() < 2 {
            return CommentParseResult::Ignore;
        }

        if tokens[0] == TERRAFORM_EXECUTABLE {
            return CommentParseResult::DidYouMean(DID_YOU_MEAN_ATLANTIS.to_string());
        }

        let bot_mention = format!("@{}", self.bot_user(host));
        if tokens[0] != ATLANTIS_EXECUTABLE && tokens[0] != bot_mention {
            return CommentParseResult::Ignore;
        }

        match tokens[1] {
            "help" | "-h" | "--help" => CommentParseResult::Help(HELP_COMMENT.to_string()),
            "plan" => Self::parse_args(CommandName::Plan, &tokens[2..]),
            "apply" => Self::parse_args(CommandName::Apply, &tokens[2..]),
            "unlock" => Self::parse_unlock(&tokens[2..]),
            unknown => CommentParseResult::ParseError(format!(
                "```\nError: unknown command {unknown:?}.\nRun 'atlantis --help' for usage.\n```"
            )),
        }
    }

    /// Parses the flag portion of a plan/apply comment.
    fn parse_args(name: CommandName, args: &[&str]) -> CommentParseResult {
        let usage = match name {
            CommandName::Apply => APPLY_USAGE,
            _ => PLAN_USAGE,
        };

        // Tokens after a bare `--` are passed through to terraform; split
        // them off before clap sees anything.
        let split_at = args.iter().position(|t| *t == "--");
        let (flag_tokens, extra_tokens): (&[&str], &[&str]) = match split_at {
            Some(i) => (&args[..i], &args[i + 1..]),
            None => (args, &[]),
        };

        if flag_tokens.iter().any(|t| *t == "-h" || *t == "--help") {
            return CommentParseResult::Help(format!("```\n{usage}```"));
        }

        let matches = flag_parser(name)
            .try_get_matches_from(flag_tokens.iter().copied())
            .map_err(|e| {
                CommentParseResult::ParseError(format!("```\n{}\n{usage}```", first_line(&e)))
            });
        let matches = match matches {
            Ok(m) => m,
            Err(resp) => return resp,
        };

        let unused: Vec<&String> = matches
            .get_many::<String>("unused")
            .map(Iterator::collect)
            .unwrap_or_default();
        if !unused.is_empty() {
            let joined = unused
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            return CommentParseResult::ParseError(format!(
                "```\nError: unknown argument(s) – {joined}.\n{usage}```"
            ));
        }

        let workspace = matches
            .get_one::<String>("workspace")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
        if workspace == "/" || workspace.contains("..") {
            return CommentParseResult::ParseError(format!(
                "```\nError: invalid workspace {workspace:?}.\n{usage}```"
            ));
        }

        let dir = match matches.get_one::<String>("dir") {
            Some(raw) => {
                let cleaned = clean_dir(raw);
                if cleaned == ".." || cleaned.starts_with("../") {
                    return CommentParseResult::ParseError(format!(
                        "```\nError: using a relative path {raw:?} with -d/--dir is not allowed.\n{usage}```"
                    ));
                }
                cleaned
            }
            None => String::new(),
        };

        // Each extra token is quoted before it can ever be concatenated
        // into a shell line downstream.
        let flags = extra_tokens.iter().map(|t| format!("{t:?}")).collect();

        CommentParseResult::Command(Command {
            name,
            workspace,
            dir,
            verbose: matches.get_flag("verbose"),
            flags,
        })
    }

    /// `unlock` takes no flags; anything else is an error.
    fn parse_unlock(args: &[&str]) -> CommentParseResult {
        if args.is_empty() {
            CommentParseResult::Command(Command::new(CommandName::Unlock))
        } else {
            let joined = args.join(" ");
            CommentParseResult::ParseError(format!(
                "```\nError: unknown argument(s) – {joined}.\n{UNLOCK_USAGE}```"
            ))
        }
    }
}

/// Builds the clap grammar shared by plan and apply.
fn flag_parser(name: CommandName) -> clap::Command {
    clap::Command::new(match name {
        CommandName::Apply => "apply",
        _ => "plan",
    })
    .no_binary_name(true)
    .disable_help_flag(true)
    .arg(Arg::new("dir").short('d').long("dir").num_args(1))
    .arg(
        Arg::new("workspace")
            .short('w')
            .long("workspace")
            .num_args(1),
    )
    .arg(
        Arg::new("verbose")
            .long("verbose")
            .action(ArgAction::SetTrue),
    )
    .arg(Arg::new("unused").num_args(0..))
}

/// The headline of a clap error, without its trailing usage block.
fn first_line(err: &clap::Error) -> String {
    err.to_string().lines().next().unwrap_or_default().to_string()
}

/// Cleans a `-d` value into a normalised repo-relative path.
///
/// Leading slashes are treated as relative to the repo root, `.` segments
/// are dropped and `..` segments pop. A result that still escapes the
/// root (`..` prefix) is rejected by the caller.
fn clean_dir(raw: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    let mut parents = 0usize;
    for part in raw.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if stack.pop().is_none() {
                    parents += 1;
                }
            }
            p => stack.push(p),
        }
    }
    let mut parts = vec![".."; parents];
    parts.extend(stack);
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}
