//! # atlantis-core
//!
//! Core library for the Atlantis command-execution engine: the subsystem
//! that turns a "run plan/apply on PR N" request into an ordered,
//! idempotent, mutually-exclusive execution of terraform commands across
//! one or more project directories.
//!
//! This crate holds the leaf services the engine is assembled from:
//!
//! - **Models**: repos, pull requests, projects, workspaces, commands
//! - **Comment parsing**: free-text PR comments into typed commands
//! - **Locking**: persistent mutual exclusion keyed by project+workspace
//! - **Project discovery**: changed files into project directories
//! - **Project config**: optional per-project `atlantis.yaml`
//! - **Terraform**: version-aware, crash-safe command execution
//! - **Hooks**: user-configured shell commands around pipeline phases
//! - **Drainer**: graceful-shutdown gate for in-flight commands
//!
//! The server crate (`atlantis-server`) composes these into the command
//! handler, executors and HTTP lock surface.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod comment;
pub mod config;
pub mod drainer;
pub mod hooks;
pub mod locking;
pub mod models;
pub mod projects;
pub mod runlog;
pub mod terraform;

pub use comment::{CommentParseResult, CommentParser};
pub use locking::{Locker, ProjectLock, TryLockResponse};
pub use models::{Command, CommandName, HostType, Project, PullRequest, Repo, User};
