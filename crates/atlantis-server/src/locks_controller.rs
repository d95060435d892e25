//! The lock admin HTTP surface.
//!
//! Three routes, addressed by the opaque lock key in the `id` query
//! parameter (URL-encoded by the caller):
//!
//! - `GET /locks` lists all locks as JSON
//! - `GET /lock?id=` renders the lock detail page
//! - `DELETE /locks?id=` discards a lock and notifies the originating PR

use std::sync::Arc;

use atlantis_core::locking::{Locker, ProjectLock};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::vcs::{ClientProxy, VcsClient};

/// Everything the lock routes need.
#[derive(Clone)]
pub struct LocksState {
    /// Lock service.
    pub locker: Locker,
    /// Host clients for the post-delete comment.
    pub vcs: Arc<ClientProxy>,
    /// Renderer for the lock detail page.
    pub template: Arc<dyn LockDetailRenderer>,
}

/// Data handed to the lock detail template.
#[derive(Debug, Clone)]
pub struct LockDetailData {
    /// The raw lock key.
    pub lock_key: String,
    /// Link to the pull request holding the lock.
    pub pull_request_link: String,
    /// Login of the lock holder.
    pub locked_by: String,
    /// Locked workspace.
    pub workspace: String,
    /// Locked project path.
    pub path: String,
}

/// Renders the HTML lock detail page.
///
/// The full template lives outside the core; [`SimpleLockDetailPage`]
/// is a minimal stand-in.
pub trait LockDetailRenderer: Send + Sync {
    /// Renders the page body for one lock.
    fn render(&self, data: &LockDetailData) -> String;
}

/// Minimal lock detail page.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleLockDetailPage;

impl LockDetailRenderer for SimpleLockDetailPage {
    fn render(&self, data: &LockDetailData) -> String {
        format!(
            "<html><body><h1>Atlantis Lock</h1>\
             <p>id: {}</p>\
             <p>dir: {} workspace: {}</p>\
             <p>locked by: {}</p>\
             <p><a href=\"{}\">pull request</a></p>\
             </body></html>",
            data.lock_key, data.path, data.workspace, data.locked_by, data.pull_request_link
        )
    }
}

/// JSON body of `GET /locks`.
#[derive(Debug, Serialize)]
pub struct GetLocksResponse {
    /// One entry per held lock.
    #[serde(rename = "Result")]
    pub result: Vec<LockData>,
}

/// One lock in the `GET /locks` listing.
#[derive(Debug, Serialize)]
pub struct LockData {
    /// Link to the PR holding the lock.
    #[serde(rename = "PullRequestURL")]
    pub pull_request_url: String,
    /// The lock key, usable as `id`.
    #[serde(rename = "LockID")]
    pub lock_id: String,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: Option<String>,
}

/// Builds the router for the lock routes.
pub fn router(state: LocksState) -> Router {
    Router::new()
        .route("/locks", get(get_locks).delete(delete_lock))
        .route("/lock", get(get_lock))
        .with_state(state)
}

async fn get_locks(State(state): State<LocksState>) -> Response {
    match state.locker.list() {
        Ok(locks) => {
            let result = locks
                .into_iter()
                .map(|(key, lock)| LockData {
                    pull_request_url: lock.pull.url,
                    lock_id: key,
                })
                .collect();
            Json(GetLocksResponse { result }).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error listing locks: {e}"),
        )
            .into_response(),
    }
}

async fn get_lock(State(state): State<LocksState>, Query(params): Query<IdParams>) -> Response {
    let Some(id) = params.id else {
        return (StatusCode::BAD_REQUEST, "No lock id in request").into_response();
    };
    match state.locker.get_lock(&id) {
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed getting lock: {e}"),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            format!("No lock found at id {id:?}"),
        )
            .into_response(),
        Ok(Some(lock)) => {
            let data = LockDetailData {
                lock_key: id,
                pull_request_link: lock.pull.url.clone(),
                locked_by: lock.pull.author.clone(),
                workspace: lock.workspace.clone(),
                path: lock.project.path.clone(),
            };
            Html(state.template.render(&data)).into_response()
        }
    }
}

async fn delete_lock(State(state): State<LocksState>, Query(params): Query<IdParams>) -> Response {
    let Some(id) = params.id else {
        return (StatusCode::BAD_REQUEST, "No lock id in request").into_response();
    };
    match state.locker.unlock(&id) {
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("deleting lock failed with: {e}"),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            format!("No lock found at id {id:?}"),
        )
            .into_response(),
        Ok(Some(lock)) => {
            comment_on_deleted_lock(&state, &lock);
            (StatusCode::OK, format!("Deleted lock id {id:?}")).into_response()
        }
    }
}

/// Comments on the originating PR after a lock is discarded.
///
/// Locks persisted by very old versions may predate the base-repo field;
/// those are skipped silently.
fn comment_on_deleted_lock(state: &LocksState, lock: &ProjectLock) {
    let Some(base_repo) = &lock.pull.base_repo else {
        return;
    };
    let comment = format!(
        "**Warning**: The plan for dir: `{}` workspace: `{}` was **discarded** via the \
         Atlantis UI.\n\nTo `apply` this plan you must run `plan` again.",
        lock.project.path, lock.workspace
    );
    if let Err(e) = state.vcs.create_comment(base_repo, lock.pull.num, &comment) {
        warn!("failed commenting on pull request: {e}");
    }
}
