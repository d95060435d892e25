//! Per-PR workspace mutex.
//!
//! Within one pull request, only one command may run per workspace at a
//! time. A second concurrent command is rejected immediately with a
//! "workspace currently locked" comment; nothing queues or waits. This
//! is in-memory state: unlike the project locks it does not survive a
//! restart and is scoped to the handler's lifetime.

use std::collections::HashSet;
use std::sync::Mutex;

/// Try-lock set keyed by (repo full name, workspace, pull number).
#[derive(Debug, Default)]
pub struct WorkspaceLocker {
    locks: Mutex<HashSet<(String, String, u64)>>,
}

impl WorkspaceLocker {
    /// An empty locker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_set(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String, u64)>> {
        self.locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Attempts to claim the workspace for this pull. Returns `false`
    /// when another command on the same pull+workspace is running.
    #[must_use]
    pub fn try_lock(&self, repo_full_name: &str, workspace: &str, pull_num: u64) -> bool {
        self.lock_set().insert((
            repo_full_name.to_string(),
            workspace.to_string(),
            pull_num,
        ))
    }

    /// Releases the claim taken by [`try_lock`](Self::try_lock).
    pub fn unlock(&self, repo_full_name: &str, workspace: &str, pull_num: u64) {
        self.lock_set().remove(&(
            repo_full_name.to_string(),
            workspace.to_string(),
            pull_num,
        ));
    }
}
