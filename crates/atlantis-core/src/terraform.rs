//! Running terraform commands.
//!
//! The client detects the default terraform version from `$PATH` at
//! startup. Projects can pin another version, which selects an alternate
//! binary by the `terraform{version}` naming convention.
//!
//! Commands run through `sh -c` so extra arguments referencing exported
//! environment variables (ex. `-var-file=$WORKSPACE.tfvars`) expand, and
//! through a crash-safe pipe: merged stdout+stderr is read from a single
//! OS pipe and the reader stops on EOF or on observing the terraform
//! crash banner. A panicking terraform can fork helpers that keep the
//! pipe's write end open forever, so waiting for EOF alone would hang
//! the worker thread.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use regex::Regex;
use thiserror::Error;

use crate::runlog::RunLog;

/// Name of the plugin cache directory inside the data dir.
const PLUGIN_CACHE_DIR_NAME: &str = "plugin-cache";

/// The last three lines of a terraform crash log.
const CRASH_BANNER: [&str; 3] = [
    "[1]: https://github.com/hashicorp/terraform/issues",
    "",
    "!!!!!!!!!!!!!!!!!!!!!!!!!!! TERRAFORM CRASH !!!!!!!!!!!!!!!!!!!!!!!!!!!!",
];

/// Errors from terraform invocations.
#[derive(Debug, Error)]
pub enum TerraformError {
    /// No terraform binary on `$PATH`.
    #[error(
        "terraform not found in $PATH. \n\nDownload terraform from \
         https://www.terraform.io/downloads.html"
    )]
    NotInstalled,

    /// `terraform version` output was unrecognisable.
    #[error("could not parse terraform version from {0:?}")]
    VersionParse(String),

    /// The command exited non-zero (or crashed); `output` holds the
    /// merged stdout+stderr for the user-facing comment.
    #[error("running {command:?} in {dir:?}: exit status {status}\n{output}")]
    CommandFailed {
        /// The full `terraform ...` command line.
        command: String,
        /// Directory the command ran in.
        dir: String,
        /// Exit status, `-1` when killed.
        status: i32,
        /// Merged stdout+stderr.
        output: String,
    },

    /// The command could not be spawned or its output read.
    #[error("running {command:?} in {dir:?}: {source}")]
    Io {
        /// The full command line.
        command: String,
        /// Directory the command ran in.
        dir: String,
        /// Underlying failure.
        source: std::io::Error,
    },
}

/// Abstraction over the terraform client so executors can be tested
/// without a terraform binary.
pub trait TerraformRunner: Send + Sync {
    /// The version used when a project doesn't pin one.
    fn default_version(&self) -> &str;

    /// Whether `version` resolves to an installed binary.
    fn version_installed(&self, version: &str) -> bool;

    /// Runs terraform with `args` in `path`.
    ///
    /// `version` of `None` means the default version. `extra_env` is
    /// exported to the process on top of the standard terraform
    /// variables.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError`] on spawn failure or non-zero exit.
    fn run_command_with_version(
        &self,
        log: &RunLog,
        path: &Path,
        args: &[String],
        version: Option<&str>,
        workspace: &str,
        extra_env: &[(String, String)],
    ) -> Result<String, TerraformError>;
}

/// The real terraform client.
#[derive(Debug)]
pub struct TerraformClient {
    default_version: String,
    plugin_cache_dir: PathBuf,
}

impl TerraformClient {
    /// Detects the default terraform version and prepares the shared
    /// plugin cache under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`TerraformError::NotInstalled`] when no terraform binary
    /// is on `$PATH` and [`TerraformError::VersionParse`] when its
    /// version output is unrecognisable.
    pub fn new(data_dir: &Path) -> Result<Self, TerraformError> {
        let output = Command::new("terraform")
            .arg("version")
            .output()
            .map_err(|_| TerraformError::NotInstalled)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let default_version = parse_version(&stdout)?;

        let plugin_cache_dir = data_dir.join(PLUGIN_CACHE_DIR_NAME);
        std::fs::create_dir_all(&plugin_cache_dir).map_err(|source| TerraformError::Io {
            command: "mkdir plugin-cache".to_string(),
            dir: data_dir.display().to_string(),
            source,
        })?;

        Ok(Self {
            default_version,
            plugin_cache_dir,
        })
    }

    /// Builds a client with a known version, skipping detection.
    ///
    /// Useful for tests and environments that manage terraform installs
    /// out of band.
    #[must_use]
    pub fn with_default_version(version: &str, plugin_cache_dir: PathBuf) -> Self {
        Self {
            default_version: version.to_string(),
            plugin_cache_dir,
        }
    }
}

impl TerraformRunner for TerraformClient {
    fn default_version(&self) -> &str {
        &self.default_version
    }

    fn version_installed(&self, version: &str) -> bool {
        if version == self.default_version {
            return true;
        }
        lookup_path(&format!("terraform{version}"))
    }

    fn run_command_with_version(
        &self,
        log: &RunLog,
        path: &Path,
        args: &[String],
        version: Option<&str>,
        workspace: &str,
        extra_env: &[(String, String)],
    ) -> Result<String, TerraformError> {
        let version = version.unwrap_or(&self.default_version);
        let executable = if version == self.default_version {
            "terraform".to_string()
        } else {
            format!("terraform{version}")
        };
        let command = format!("{executable} {}", args.join(" "));

        let mut env: Vec<(String, String)> = vec![
            // De-emphasises interactive hints in terraform's output.
            ("TF_IN_AUTOMATION".to_string(), "true".to_string()),
            (
                "TF_PLUGIN_CACHE_DIR".to_string(),
                self.plugin_cache_dir.display().to_string(),
            ),
            ("WORKSPACE".to_string(), workspace.to_string()),
            ("TOOL_VERSION".to_string(), version.to_string()),
            ("DIR".to_string(), path.display().to_string()),
        ];
        env.extend(extra_env.iter().cloned());

        let output = crash_safe_exec(&command, path, &env)?;
        log.info(format!("successfully ran {command:?} in {path:?}"));
        Ok(output)
    }
}

/// Extracts the version from `terraform version` output.
///
/// `Terraform v0.12.0-alpha4 (2c36829d3265661d8edbd5014de8090ea7e2a076)`
/// parses to `0.12.0-alpha4`.
fn parse_version(version_output: &str) -> Result<String, TerraformError> {
    let re = Regex::new(r"Terraform v(\S+)").expect("static regex");
    re.captures(version_output)
        .map(|c| c[1].to_string())
        .ok_or_else(|| TerraformError::VersionParse(version_output.to_string()))
}

/// Whether this version uses `init` (0.9 and later) instead of `get`.
#[must_use]
pub fn uses_init(version: &str) -> bool {
    let (major, minor) = major_minor(version);
    major > 0 || minor >= 9
}

/// Whether this version names the workspace command `env` (0.9.x) rather
/// than `workspace` (0.10 and later).
#[must_use]
pub fn uses_env_command(version: &str) -> bool {
    let (major, minor) = major_minor(version);
    major == 0 && minor == 9
}

/// Leading `major.minor` of a version string; suffixes are ignored.
fn major_minor(version: &str) -> (u64, u64) {
    let numeric = |s: &str| -> u64 {
        s.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .unwrap_or(0)
    };
    let mut parts = version.split('.');
    let major = parts.next().map_or(0, numeric);
    let minor = parts.next().map_or(0, numeric);
    (major, minor)
}

/// Whether `bin` resolves to an executable on `$PATH`.
fn lookup_path(bin: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(bin)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Runs `command` through `sh -c` in `dir`, reading merged stdout+stderr
/// from one OS pipe until EOF or the terraform crash banner.
fn crash_safe_exec(
    command: &str,
    dir: &Path,
    env: &[(String, String)],
) -> Result<String, TerraformError> {
    let io_err = |source| TerraformError::Io {
        command: command.to_string(),
        dir: dir.display().to_string(),
        source,
    };

    let (reader, writer) = std::io::pipe().map_err(io_err)?;
    let writer_stderr = writer.try_clone().map_err(io_err)?;

    let mut child = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_stderr);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.spawn().map_err(io_err)?
        // `cmd` drops here, closing the parent's copies of the write end
        // so EOF tracks the child and anything it forked.
    };

    let mut lines: Vec<String> = Vec::new();
    let mut crashed = false;
    for line in BufReader::new(reader).lines() {
        let line = line.map_err(io_err)?;
        lines.push(line);
        if ends_with_banner(&lines) {
            crashed = true;
            break;
        }
    }

    if crashed {
        // A crashed terraform never delivers EOF; don't wait for it.
        let _ = child.kill();
    }
    let status = child.wait().map_err(io_err)?;
    let output = lines.join("\n");

    if crashed || !status.success() {
        return Err(TerraformError::CommandFailed {
            command: command.to_string(),
            dir: dir.display().to_string(),
            status: status.code().unwrap_or(-1),
            output,
        });
    }
    Ok(output)
}

fn ends_with_banner(lines: &[String]) -> bool {
    lines.len() >= CRASH_BANNER.len()
        && lines[lines.len() - CRASH_BANNER.len()..]
            .iter()
            .map(String::as_str)
            .eq(CRASH_BANNER)
}
