//! User-configured hook commands.
//!
//! Projects can hook shell commands before and after each pipeline phase
//! (`pre_plan`, `post_apply`, ...). A stage's commands run as one
//! `sh -e` script in the project's absolute directory with the command
//! environment exported, so hooks see `WORKSPACE`, `DIR`, `USER_NAME`
//! and the rest. The first failing command aborts the stage.

use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::runlog::RunLog;

/// Errors from hook execution.
#[derive(Debug, Error)]
pub enum HookError {
    /// The hook shell could not be spawned.
    #[error("running {stage} commands: {source}")]
    Io {
        /// Which stage was running.
        stage: String,
        /// Underlying failure.
        source: std::io::Error,
    },

    /// A hook command exited non-zero.
    #[error("running {stage} commands: exit status {status}\n{output}")]
    Failed {
        /// Which stage was running.
        stage: String,
        /// Exit status, `-1` when killed.
        status: i32,
        /// Combined stdout+stderr of the stage.
        output: String,
    },
}

/// Runs hook command lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookRunner;

impl HookRunner {
    /// Runs `commands` as one `sh -e` script in `path` with `env`
    /// exported, returning the combined output.
    ///
    /// `stage` names the phase (`pre_plan`, `post_apply`, ...) for log
    /// and error messages only.
    ///
    /// # Errors
    ///
    /// Returns [`HookError`] if the shell cannot be spawned or any
    /// command exits non-zero.
    pub fn execute(
        log: &RunLog,
        commands: &[String],
        path: &Path,
        env: &[(String, String)],
        stage: &str,
    ) -> Result<String, HookError> {
        if commands.is_empty() {
            return Ok(String::new());
        }
        let script = commands.join("\n");
        log.info(format!("running {stage} commands: {commands:?}"));

        let mut cmd = Command::new("sh");
        cmd.arg("-ec")
            .arg(&script)
            .current_dir(path)
            .stdin(Stdio::null());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = cmd.output().map_err(|source| HookError::Io {
            stage: stage.to_string(),
            source,
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim_end().to_string();

        if output.status.success() {
            Ok(combined)
        } else {
            Err(HookError::Failed {
                stage: stage.to_string(),
                status: output.status.code().unwrap_or(-1),
                output: combined,
            })
        }
    }
}
