//! Deriving the set of project directories from a changed-file list.
//!
//! A project is the directory containing a modified `*.tf` file. A
//! modification under an `env/` folder (`env/{workspace}.tfvars`) is
//! attributed to the directory containing the `env` folder, so editing
//! `proj/env/staging.tfvars` plans `proj`.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::debug;

use crate::models::Project;

/// Derives projects from modified file paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectFinder;

impl ProjectFinder {
    /// Returns the deduplicated, lexicographically ordered projects
    /// touched by `modified_files` (paths relative to the repo root).
    #[must_use]
    pub fn determine_projects(modified_files: &[String], repo_full_name: &str) -> Vec<Project> {
        let mut paths: BTreeSet<String> = BTreeSet::new();
        for file in modified_files {
            if let Some(dir) = project_dir(file) {
                paths.insert(dir);
            }
        }

        let projects: Vec<Project> = paths
            .into_iter()
            .map(|p| Project::new(repo_full_name, &p))
            .collect();
        debug!(
            repo = repo_full_name,
            modified = modified_files.len(),
            projects = projects.len(),
            "determined modified projects"
        );
        projects
    }
}

/// Maps one modified file to the project directory it belongs to, or
/// `None` when the file is not a terraform file.
fn project_dir(file: &str) -> Option<String> {
    let path = Path::new(file);

    // env/{workspace}.tfvars belongs to the directory containing `env`.
    if path.extension().is_some_and(|e| e == "tfvars")
        && path.parent().and_then(Path::file_name).is_some_and(|d| d == "env")
    {
        let project = path.parent().and_then(Path::parent)?;
        return Some(dir_or_root(project));
    }

    if path.extension().is_some_and(|e| e == "tf") {
        return Some(dir_or_root(path.parent()?));
    }

    None
}

fn dir_or_root(dir: &Path) -> String {
    if dir.as_os_str().is_empty() {
        ".".to_string()
    } else {
        dir.to_string_lossy().into_owned()
    }
}
