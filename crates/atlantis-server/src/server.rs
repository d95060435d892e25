//! Server assembly.
//!
//! Wires the core services into the command pipeline and the lock admin
//! routes, and runs the HTTP surface until SIGINT/SIGTERM. On shutdown
//! the drainer blocks new commands and waits for in-flight ones before
//! the process exits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atlantis_core::comment::CommentParser;
use atlantis_core::drainer::Drainer;
use atlantis_core::locking::{Locker, SqliteLockStore};
use atlantis_core::terraform::{TerraformClient, TerraformRunner};
use axum::Router;
use tracing::info;

use crate::events::apply_executor::ApplyExecutor;
use crate::events::command_handler::CommandHandler;
use crate::events::plan_executor::PlanExecutor;
use crate::events::pre_executor::ProjectPreExecutor;
use crate::events::pull_closed::PullClosedExecutor;
use crate::events::workspace::FileWorkspace;
use crate::events::workspace_locker::WorkspaceLocker;
use crate::lock_url::LockUrlBuilder;
use crate::locks_controller::{self, LocksState, SimpleLockDetailPage};
use crate::markdown::MarkdownRenderer;
use crate::vcs::ClientProxy;
use crate::webhooks;

/// User-supplied server configuration.
pub struct ServerConfig {
    /// Directory holding the lock store, plugin cache and clone trees.
    pub data_dir: PathBuf,
    /// External base URL of this server, used in lock links.
    pub atlantis_url: String,
    /// Port the HTTP surface listens on.
    pub port: u16,
    /// Whether commands may run on fork PRs.
    pub allow_fork_prs: bool,
    /// Whether applies require an approved PR.
    pub require_approval: bool,
    /// Bot username on GitHub (for `@bot plan` comments).
    pub github_user: String,
    /// Bot username on GitLab.
    pub gitlab_user: String,
    /// Host API clients, registered by the ingress layer.
    pub vcs_clients: ClientProxy,
    /// Apply-result notifier.
    pub webhooks: Arc<dyn webhooks::Sender>,
}

/// A fully wired server.
pub struct Server {
    /// Entry point for comment-command events.
    pub command_handler: Arc<CommandHandler>,
    /// Entry point for pull-closed events.
    pub pull_cleaner: PullClosedExecutor,
    /// Comment parsing for the ingress layer.
    pub comment_parser: CommentParser,
    /// Shutdown gate shared with the handler.
    pub drainer: Arc<Drainer>,
    router: Router,
    port: u16,
}

impl Server {
    /// Wires all components. Fails when the lock store cannot be opened
    /// (another instance running) or terraform is missing.
    ///
    /// # Errors
    ///
    /// Returns an error when startup preconditions aren't met.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteLockStore::new(&config.data_dir).context("initializing lock store")?,
        );
        let locker = Locker::new(store);
        let terraform = Arc::new(
            TerraformClient::new(&config.data_dir).context("initializing terraform client")?,
        );
        info!(
            version = terraform.default_version(),
            "detected default terraform version"
        );

        let workspace = Arc::new(FileWorkspace::new(&config.data_dir));
        let vcs = Arc::new(config.vcs_clients);
        let lock_urls = LockUrlBuilder::new(&config.atlantis_url);
        let drainer = Arc::new(Drainer::new());

        let pre_executor = Arc::new(ProjectPreExecutor {
            locker: locker.clone(),
            terraform: terraform.clone(),
            lock_urls: lock_urls.clone(),
        });
        let plan_executor = Arc::new(PlanExecutor {
            vcs: vcs.clone(),
            terraform: terraform.clone(),
            locker: locker.clone(),
            workspace: workspace.clone(),
            pre_executor: pre_executor.clone(),
            lock_urls: lock_urls.clone(),
        });
        let apply_executor = Arc::new(ApplyExecutor {
            vcs: vcs.clone(),
            terraform,
            require_approval: config.require_approval,
            workspace: workspace.clone(),
            pre_executor,
            locker: locker.clone(),
            webhooks: config.webhooks,
        });

        let command_handler = Arc::new(CommandHandler {
            plan_executor,
            apply_executor,
            vcs: vcs.clone(),
            commit_status: crate::events::commit_status::CommitStatusUpdater::new(vcs.clone()),
            renderer: Arc::new(MarkdownRenderer),
            workspace_locker: Arc::new(WorkspaceLocker::new()),
            locker: locker.clone(),
            drainer: drainer.clone(),
            allow_fork_prs: config.allow_fork_prs,
            allow_fork_prs_flag: "allow-fork-prs".to_string(),
        });
        let pull_cleaner = PullClosedExecutor {
            locker: locker.clone(),
            workspace,
        };
        let comment_parser = CommentParser {
            github_user: config.github_user,
            gitlab_user: config.gitlab_user,
            ..CommentParser::default()
        };

        let router = locks_controller::router(LocksState {
            locker,
            vcs,
            template: Arc::new(SimpleLockDetailPage),
        });

        Ok(Self {
            command_handler,
            pull_cleaner,
            comment_parser,
            drainer,
            router,
            port: config.port,
        })
    }

    /// Serves the HTTP surface until SIGINT/SIGTERM, then drains.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind or serving fails.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("binding port {}", self.port))?;
        info!(port = self.port, "Atlantis started - listening for lock requests");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("serving HTTP")?;

        info!("waiting for in-flight commands to finish");
        let drainer = self.drainer;
        tokio::task::spawn_blocking(move || drainer.shut_down_blocking())
            .await
            .context("draining in-flight commands")?;
        info!("shutdown complete");
        Ok(())
    }
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to register ctrl-c");
        info!("received ctrl-c");
    }
}
