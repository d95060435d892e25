//! End-to-end scenarios through the real pipeline.
//!
//! These tests wire the production components (SQLite lock store, file
//! workspace over real git clones, executors, command handler, lock
//! routes) around two stubs: a fake `terraform` binary on `$PATH` and an
//! in-memory VCS client.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use atlantis_core::comment::{CommentParseResult, CommentParser};
use atlantis_core::drainer::Drainer;
use atlantis_core::locking::{Locker, SqliteLockStore};
use atlantis_core::models::{CommitStatus, HostType, PullRequest, PullState, Repo, User};
use atlantis_core::terraform::TerraformClient;
use atlantis_server::events::apply_executor::ApplyExecutor;
use atlantis_server::events::command_handler::CommandHandler;
use atlantis_server::events::commit_status::CommitStatusUpdater;
use atlantis_server::events::plan_executor::PlanExecutor;
use atlantis_server::events::pre_executor::ProjectPreExecutor;
use atlantis_server::events::pull_closed::PullClosedExecutor;
use atlantis_server::events::workspace::FileWorkspace;
use atlantis_server::events::workspace_locker::WorkspaceLocker;
use atlantis_server::lock_url::LockUrlBuilder;
use atlantis_server::locks_controller::{self, LocksState, SimpleLockDetailPage};
use atlantis_server::markdown::MarkdownRenderer;
use atlantis_server::vcs::{ClientProxy, MockVcsClient, VcsClient};
use atlantis_server::webhooks::RecordingSender;
use tempfile::TempDir;
use tower::ServiceExt;

/// A fake terraform that satisfies init/workspace/plan/apply. `plan`
/// writes the `-out` artifact like the real tool.
const FAKE_TERRAFORM: &str = r#"#!/bin/sh
cmd="$1"
case "$cmd" in
  init|get)
    echo "Initialized"
    ;;
  workspace|env)
    echo "default"
    ;;
  plan)
    out=""
    prev=""
    for a in "$@"; do
      if [ "$prev" = "-out" ]; then
        out="$a"
      fi
      prev="$a"
    done
    if [ -n "$out" ]; then
      echo "fake plan" > "$out"
    fi
    echo "+ fake_resource.one"
    ;;
  apply)
    echo "Apply complete! Resources: 1 added, 0 changed, 0 destroyed."
    ;;
  *)
    echo "unexpected terraform command: $*" >&2
    exit 1
    ;;
esac
"#;

struct Harness {
    handler: CommandHandler,
    locker: Locker,
    workspace: Arc<FileWorkspace>,
    github: Arc<MockVcsClient>,
    webhooks: Arc<RecordingSender>,
    vcs: Arc<ClientProxy>,
    data_dir: TempDir,
    source_repo: TempDir,
}

fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?}: {}{}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Creates the source repo: `main.tf` at root plus `a/` and `b/`
/// projects, all on branch `feature`.
fn init_source_repo(dir: &Path) {
    git(dir, &["init", "--initial-branch=main", "."]);
    std::fs::write(dir.join("main.tf"), "# root\n").unwrap();
    std::fs::create_dir_all(dir.join("a")).unwrap();
    std::fs::create_dir_all(dir.join("b")).unwrap();
    std::fs::write(dir.join("a/main.tf"), "# a\n").unwrap();
    std::fs::write(dir.join("b/main.tf"), "# b\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "init"]);
    git(dir, &["checkout", "-b", "feature"]);
}

fn harness() -> Harness {
    install_fake_terraform();

    let data_dir = TempDir::new().unwrap();
    let source_repo = TempDir::new().unwrap();
    init_source_repo(source_repo.path());

    let github = Arc::new(MockVcsClient::new());
    let vcs = Arc::new(
        ClientProxy::new().with_client(HostType::Github, github.clone() as Arc<dyn VcsClient>),
    );
    let store = Arc::new(SqliteLockStore::new(data_dir.path()).unwrap());
    let locker = Locker::new(store);
    let terraform = Arc::new(TerraformClient::with_default_version(
        "0.11.10",
        data_dir.path().join("plugin-cache"),
    ));
    let workspace = Arc::new(FileWorkspace::new(data_dir.path()));
    let lock_urls = LockUrlBuilder::new("https://atlantis.example.com");
    let webhooks = Arc::new(RecordingSender::new());

    let pre_executor = Arc::new(ProjectPreExecutor {
        locker: locker.clone(),
        terraform: terraform.clone(),
        lock_urls: lock_urls.clone(),
    });
    let handler = CommandHandler {
        plan_executor: Arc::new(PlanExecutor {
            vcs: vcs.clone(),
            terraform: terraform.clone(),
            locker: locker.clone(),
            workspace: workspace.clone(),
            pre_executor: pre_executor.clone(),
            lock_urls,
        }),
        apply_executor: Arc::new(ApplyExecutor {
            vcs: vcs.clone(),
            terraform,
            require_approval: false,
            workspace: workspace.clone(),
            pre_executor,
            locker: locker.clone(),
            webhooks: webhooks.clone(),
        }),
        vcs: vcs.clone(),
        commit_status: CommitStatusUpdater::new(vcs.clone()),
        renderer: Arc::new(MarkdownRenderer),
        workspace_locker: Arc::new(WorkspaceLocker::new()),
        locker: locker.clone(),
        drainer: Arc::new(Drainer::new()),
        allow_fork_prs: false,
        allow_fork_prs_flag: "allow-fork-prs".to_string(),
    };

    Harness {
        handler,
        locker,
        workspace,
        github,
        webhooks,
        vcs,
        data_dir,
        source_repo,
    }
}

/// Puts the fake terraform on `$PATH` exactly once per test process.
fn install_fake_terraform() {
    static INSTALLED: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    INSTALLED.get_or_init(|| {
        let bin_dir =
            std::env::temp_dir().join(format!("atlantis-fake-terraform-{}", std::process::id()));
        std::fs::create_dir_all(&bin_dir).unwrap();
        let path = bin_dir.join("terraform");
        std::fs::write(&path, FAKE_TERRAFORM).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let current = std::env::var_os("PATH").unwrap_or_default();
        let mut paths: Vec<PathBuf> = vec![bin_dir];
        paths.extend(std::env::split_paths(&current));
        std::env::set_var("PATH", std::env::join_paths(paths).unwrap());
    });
}

impl Harness {
    fn repo(&self) -> Repo {
        let url = self.source_repo.path().display().to_string();
        Repo {
            host: HostType::Github,
            full_name: "owner/repo".to_string(),
            owner: "owner".to_string(),
            name: "repo".to_string(),
            clone_url: url.clone(),
            sanitized_clone_url: url,
        }
    }

    fn open_pull(&self, num: u64) -> PullRequest {
        PullRequest {
            num,
            branch: "feature".to_string(),
            head_commit: "abc123".to_string(),
            author: "lkysow".to_string(),
            url: format!("https://github.com/owner/repo/pull/{num}"),
            state: PullState::Open,
            base_repo: Some(self.repo()),
            head_repo: Some(self.repo()),
        }
    }

    fn user(&self) -> User {
        User {
            username: "lkysow".to_string(),
        }
    }

    /// Runs a parsed comment through the handler like the ingress would.
    fn run_comment(&self, pull_num: u64, comment: &str) {
        let parser = CommentParser::default();
        match parser.parse(comment, HostType::Github) {
            CommentParseResult::Command(command) => {
                self.handler
                    .execute_command(&self.repo(), None, &self.user(), pull_num, &command);
            }
            other => panic!("comment {comment:?} did not parse to a command: {other:?}"),
        }
    }

    fn last_comment(&self) -> String {
        self.github
            .comments()
            .last()
            .expect("no comment recorded")
            .1
            .clone()
    }

    fn last_status(&self) -> (CommitStatus, String) {
        let statuses = self.github.statuses();
        let last = statuses.last().expect("no status recorded");
        (last.state, last.description.clone())
    }

    fn clone_root(&self, pull_num: u64, workspace: &str) -> PathBuf {
        self.data_dir
            .path()
            .join("repos/owner/repo")
            .join(pull_num.to_string())
            .join(workspace)
    }
}

#[test]
fn scenario_plan_then_contention_then_apply() {
    let h = harness();
    h.github.add_pull(h.open_pull(1));
    h.github.add_pull(h.open_pull(2));
    h.github.set_modified_files(Ok(vec!["main.tf".to_string()]));

    // Scenario 1: plan on PR#1 succeeds, holds the lock, writes the
    // artifact, posts Success.
    h.run_comment(1, "atlantis plan");
    let keys: Vec<String> = h
        .locker
        .list()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["owner/repo//default"]);
    assert!(h.clone_root(1, "default").join("default.tfplan").is_file());
    let (state, description) = h.last_status();
    assert_eq!(state, CommitStatus::Success);
    assert_eq!(description, "Plan Success");
    let plan_comment = h.last_comment();
    assert!(plan_comment.contains("fake_resource.one"), "{plan_comment}");

    // Scenario 2: plan on PR#2 for the same project fails on the lock.
    h.run_comment(2, "atlantis plan");
    let comment = h.last_comment();
    assert!(
        comment.contains(
            "The default workspace is currently locked by another command for pull #1"
        ),
        "{comment}"
    );
    let (state, _) = h.last_status();
    assert_eq!(state, CommitStatus::Failed);
    assert_eq!(h.locker.list().unwrap().len(), 1, "no new lock");

    // Scenario 3: apply on PR#1 succeeds, releases the lock, notifies.
    h.run_comment(1, "atlantis apply");
    let comment = h.last_comment();
    assert!(comment.contains("Apply complete!"), "{comment}");
    assert!(h.locker.list().unwrap().is_empty(), "lock released");
    let sent = h.webhooks.results();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].success);
    assert_eq!(sent[0].workspace, "default");
}

#[test]
fn scenario_replan_is_reentrant_for_the_same_pull() {
    let h = harness();
    h.github.add_pull(h.open_pull(3));
    h.github.set_modified_files(Ok(vec![
        "a/main.tf".to_string(),
        "b/main.tf".to_string(),
    ]));

    // First plan acquires locks on both projects.
    h.run_comment(3, "atlantis plan -w default");
    let keys: Vec<String> = h
        .locker
        .list()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["owner/repo/a/default", "owner/repo/b/default"]);

    // Scenario 4: replanning with the locks already held by this PR
    // succeeds re-entrantly, in path order.
    h.run_comment(3, "atlantis plan -w default");
    let (state, _) = h.last_status();
    assert_eq!(state, CommitStatus::Success);
    let comment = h.last_comment();
    let a_pos = comment.find("dir: `a`").expect("project a in comment");
    let b_pos = comment.find("dir: `b`").expect("project b in comment");
    assert!(a_pos < b_pos, "results ordered by path: {comment}");
    assert_eq!(h.locker.list().unwrap().len(), 2, "still exactly two locks");
}

#[test]
fn scenario_pull_close_reaps_locks_and_workspace() {
    let h = harness();
    h.github.add_pull(h.open_pull(1));
    h.github.set_modified_files(Ok(vec!["main.tf".to_string()]));
    h.run_comment(1, "atlantis plan");
    assert_eq!(h.locker.list().unwrap().len(), 1);
    assert!(h.clone_root(1, "default").exists());

    // Scenario 5: the pull-closed event removes both.
    let cleaner = PullClosedExecutor {
        locker: h.locker.clone(),
        workspace: h.workspace.clone(),
    };
    cleaner.clean_up_pull(&h.repo(), &h.open_pull(1)).unwrap();
    assert!(h.locker.list().unwrap().is_empty());
    assert!(!h
        .data_dir
        .path()
        .join("repos/owner/repo/1")
        .exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_admin_delete_unlocks_and_comments() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};

    let h = tokio::task::spawn_blocking(|| {
        let h = harness();
        h.github.add_pull(h.open_pull(1));
        h.github.set_modified_files(Ok(vec!["main.tf".to_string()]));
        h.run_comment(1, "atlantis plan");
        h
    })
    .await
    .unwrap();
    assert_eq!(h.locker.list().unwrap().len(), 1);

    let router = locks_controller::router(LocksState {
        locker: h.locker.clone(),
        vcs: h.vcs.clone(),
        template: Arc::new(SimpleLockDetailPage),
    });

    // Scenario 6: DELETE /locks?id={urlenc(key)} discards the lock and
    // comments back on the PR.
    let response = router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/locks?id=owner%2Frepo%2F%2Fdefault")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8(body.to_vec()).unwrap(),
        "Deleted lock id \"owner/repo//default\""
    );

    assert!(h.locker.list().unwrap().is_empty());
    let comment = h.last_comment();
    assert!(
        comment.contains("was **discarded** via the Atlantis UI"),
        "{comment}"
    );
}
