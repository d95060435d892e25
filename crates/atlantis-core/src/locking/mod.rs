//! Persistent mutual exclusion for project/workspace pairs.
//!
//! A [`ProjectLock`] is an exclusive claim on a `(project, workspace)`
//! pair held by a single pull request for the duration of a plan-apply
//! cycle. Locks are durable: they survive server restarts and are only
//! released by a successful apply, an admin delete, an `unlock` command
//! or the pull request closing.
//!
//! The [`Locker`] is the service-facing API; storage is behind the
//! [`LockStore`] trait so tests can swap the SQLite-backed store for an
//! in-memory one.

mod store;

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Project, PullRequest, User};

pub use store::SqliteLockStore;

/// Errors from lock operations.
///
/// Storage errors bubble up as operation failures; there is no retry.
#[derive(Debug, Error)]
pub enum LockError {
    /// The underlying store failed.
    #[error("lock store transaction failed: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A stored lock record could not be decoded.
    #[error("deserializing lock at key {key:?}: {source}")]
    Corrupt {
        /// Key of the undecodable record.
        key: String,
        /// The decode failure.
        source: serde_json::Error,
    },

    /// A lock could not be encoded for storage.
    #[error("serializing lock: {0}")]
    Serialize(#[source] serde_json::Error),

    /// Filesystem-level failure creating or opening the store.
    #[error("opening lock store: {0}")]
    Io(#[from] std::io::Error),

    /// The store file is held by another process.
    #[error(
        "lock store at {path:?} is already locked (a possible cause is \
         another Atlantis instance already running)"
    )]
    AlreadyOpen {
        /// Path of the contested store file.
        path: String,
    },
}

/// An exclusive claim on a project+workspace held by one pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectLock {
    /// The locked project.
    pub project: Project,
    /// The locked terraform workspace.
    pub workspace: String,
    /// The pull request holding the lock.
    pub pull: PullRequest,
    /// The user whose command acquired the lock.
    pub user: User,
    /// When the lock was acquired. Normalised to the local zone on read.
    pub time: DateTime<Local>,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct TryLockResponse {
    /// Whether the lock was acquired by this call.
    pub lock_acquired: bool,
    /// The lock currently held. When acquisition succeeded this is the
    /// new lock; otherwise it names the holder.
    pub curr_lock: ProjectLock,
    /// The key identifying the lock, usable with [`Locker::unlock`].
    pub lock_key: String,
}

/// Storage behind the [`Locker`]: a durable, transactional key-value
/// store of lock records.
///
/// All mutating operations run inside a write transaction that reads the
/// current value, decides and writes atomically.
pub trait LockStore: Send + Sync {
    /// Atomic check-and-put. Returns `(acquired, current_holder)`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    fn try_lock(&self, new_lock: &ProjectLock) -> Result<(bool, ProjectLock), LockError>;

    /// Deletes the lock at `key`, returning the prior lock if one existed.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError>;

    /// Looks up the lock at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError>;

    /// Lists every current lock as `(key, lock)` pairs, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    fn list(&self) -> Result<Vec<(String, ProjectLock)>, LockError>;

    /// Deletes every lock held by `pull_num` in `repo_full_name` and
    /// returns the locks that were removed.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    fn unlock_by_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<ProjectLock>, LockError>;
}

/// Builds the storage key for a project+workspace.
///
/// The root project (`.`) serialises as an empty path segment, giving
/// keys like `owner/repo//default`.
#[must_use]
pub fn lock_key(project: &Project, workspace: &str) -> String {
    let path = if project.path == "." { "" } else { project.path.as_str() };
    format!("{}/{}/{}", project.repo_full_name, path, workspace)
}

/// The lock service gating all plan/apply concurrency.
#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn LockStore>,
}

impl Locker {
    /// Wraps a store in the lock service.
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    /// Attempts to acquire a lock for `pull` on `project`+`workspace`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure; contention is reported
    /// through [`TryLockResponse::lock_acquired`], not as an error.
    pub fn try_lock(
        &self,
        project: &Project,
        workspace: &str,
        pull: &PullRequest,
        user: &User,
    ) -> Result<TryLockResponse, LockError> {
        let new_lock = ProjectLock {
            project: project.clone(),
            workspace: workspace.to_string(),
            pull: pull.clone(),
            user: user.clone(),
            time: Local::now(),
        };
        let (lock_acquired, curr_lock) = self.store.try_lock(&new_lock)?;
        Ok(TryLockResponse {
            lock_acquired,
            curr_lock,
            lock_key: lock_key(project, workspace),
        })
    }

    /// Releases the lock at `key`, returning the prior lock if any.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    pub fn unlock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        self.store.unlock(key)
    }

    /// Looks up a lock by its key (the admin surface's lock id).
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    pub fn get_lock(&self, key: &str) -> Result<Option<ProjectLock>, LockError> {
        self.store.get_lock(key)
    }

    /// Lists all current locks.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    pub fn list(&self) -> Result<Vec<(String, ProjectLock)>, LockError> {
        self.store.list()
    }

    /// Bulk-releases every lock held by a pull request.
    ///
    /// # Errors
    ///
    /// Returns [`LockError`] on storage failure.
    pub fn unlock_by_pull(
        &self,
        repo_full_name: &str,
        pull_num: u64,
    ) -> Result<Vec<ProjectLock>, LockError> {
        self.store.unlock_by_pull(repo_full_name, pull_num)
    }
}
