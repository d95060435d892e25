//! Cleanup when a pull request closes or merges.
//!
//! Every lock the PR holds is released and its clone tree deleted. Both
//! halves are attempted even if one fails; commenting on a closed PR
//! would be pointless, so errors are only logged and reported upward.

use std::sync::Arc;

use atlantis_core::locking::{LockError, Locker};
use atlantis_core::models::{PullRequest, Repo};
use thiserror::Error;
use tracing::info;

use crate::events::workspace::{Workspace, WorkspaceError};

/// Failures during pull-close cleanup.
#[derive(Debug, Error)]
pub enum CleanupError {
    /// Releasing the PR's locks failed (workspace deletion still ran).
    #[error("releasing locks: {0}")]
    Locks(#[from] LockError),

    /// Deleting the clone tree failed (locks were released).
    #[error("deleting workspace: {0}")]
    Workspace(#[from] WorkspaceError),

    /// Both halves failed.
    #[error("releasing locks: {locks}; deleting workspace: {workspace}")]
    Both {
        /// The lock-release failure.
        locks: LockError,
        /// The workspace-deletion failure.
        workspace: WorkspaceError,
    },
}

/// Reaps state belonging to closed pull requests.
#[derive(Clone)]
pub struct PullClosedExecutor {
    /// Lock service.
    pub locker: Locker,
    /// Clone tree manager.
    pub workspace: Arc<dyn Workspace>,
}

impl PullClosedExecutor {
    /// Releases every lock held by the pull and deletes its clone tree.
    ///
    /// # Errors
    ///
    /// Returns [`CleanupError`] describing whichever halves failed; the
    /// other half was still attempted.
    pub fn clean_up_pull(&self, repo: &Repo, pull: &PullRequest) -> Result<(), CleanupError> {
        let locks = self.locker.unlock_by_pull(&repo.full_name, pull.num);
        let workspace = self.workspace.delete(repo, pull);

        match (locks, workspace) {
            (Ok(released), Ok(())) => {
                info!(
                    repo = %repo.full_name,
                    pull = pull.num,
                    released = released.len(),
                    "cleaned up closed pull request"
                );
                Ok(())
            }
            (Err(locks), Err(workspace)) => Err(CleanupError::Both { locks, workspace }),
            (Err(locks), Ok(())) => Err(locks.into()),
            (Ok(_), Err(workspace)) => Err(workspace.into()),
        }
    }
}
