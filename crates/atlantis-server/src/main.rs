//! atlantis-server - terraform automation for pull requests.
//!
//! Starts the command-execution engine and the lock admin HTTP surface.
//! Host API clients are registered by the webhook ingress layer; this
//! binary owns startup, the data directory and graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use atlantis_server::server::{Server, ServerConfig};
use atlantis_server::vcs::ClientProxy;
use atlantis_server::webhooks::NullSender;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Terraform automation for pull requests.
#[derive(Parser, Debug)]
#[command(name = "atlantis-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory for the lock store, plugin cache and clone trees.
    #[arg(long, default_value = ".atlantis")]
    data_dir: PathBuf,

    /// External base URL of this server, used in lock links.
    #[arg(long, default_value = "http://localhost:4141")]
    atlantis_url: String,

    /// Port to listen on.
    #[arg(long, default_value = "4141")]
    port: u16,

    /// Allow commands to run on fork pull requests.
    #[arg(long)]
    allow_fork_prs: bool,

    /// Require pull request approval before apply.
    #[arg(long)]
    require_approval: bool,

    /// Bot username on GitHub.
    #[arg(long, default_value = "")]
    gh_user: String,

    /// Bot username on GitLab.
    #[arg(long, default_value = "")]
    gitlab_user: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = Server::new(ServerConfig {
        data_dir: args.data_dir,
        atlantis_url: args.atlantis_url,
        port: args.port,
        allow_fork_prs: args.allow_fork_prs,
        require_approval: args.require_approval,
        github_user: args.gh_user,
        gitlab_user: args.gitlab_user,
        // The webhook ingress layer registers host clients here.
        vcs_clients: ClientProxy::new(),
        webhooks: Arc::new(NullSender),
    })
    .context("initializing server")?;

    server.serve().await
}
