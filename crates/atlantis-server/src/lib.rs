//! atlantis-server - the Atlantis command-execution engine.
//!
//! This crate composes the leaf services from `atlantis-core` into the
//! per-PR command pipeline: webhook-shaped events come in, terraform
//! plan/apply runs happen against checked-out working copies, and the
//! results go back out as review comments and commit statuses.
//!
//! # Modules
//!
//! - [`events`]: command handler, executors, workspace manager, reaper
//! - [`vcs`]: capability interface over the code-review hosts
//! - [`markdown`]: rendering command responses into comments
//! - [`webhooks`]: apply-result notifications
//! - [`locks_controller`]: the HTTP lock admin surface
//! - [`lock_url`]: lock detail URLs embedded in comments

pub mod events;
pub mod lock_url;
pub mod locks_controller;
pub mod markdown;
pub mod server;
pub mod vcs;
pub mod webhooks;
