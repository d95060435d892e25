//! Lock detail URLs.
//!
//! Plan comments link to the lock admin surface so reviewers can discard
//! a plan from the browser. The lock key is URL-encoded into the `id`
//! query parameter that `GET /lock` and `DELETE /locks` accept.

/// Builds lock detail URLs under the server's external base URL.
#[derive(Debug, Clone)]
pub struct LockUrlBuilder {
    atlantis_url: String,
}

impl LockUrlBuilder {
    /// Creates a builder rooted at `atlantis_url` (no trailing slash).
    #[must_use]
    pub fn new(atlantis_url: impl Into<String>) -> Self {
        let mut atlantis_url = atlantis_url.into();
        while atlantis_url.ends_with('/') {
            atlantis_url.pop();
        }
        Self { atlantis_url }
    }

    /// The detail URL for the lock at `key`.
    #[must_use]
    pub fn build(&self, key: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        format!("{}/lock?id={encoded}", self.atlantis_url)
    }
}
