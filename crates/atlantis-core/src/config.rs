//! Optional per-project configuration (`atlantis.yaml`).
//!
//! Projects can pin a terraform version, hook shell commands before and
//! after each pipeline phase, and append extra arguments to terraform
//! commands. An absent file yields the empty config; unknown keys are a
//! parse error so typos fail loudly instead of being ignored.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// File name searched for in each project directory.
pub const PROJECT_CONFIG_FILE: &str = "atlantis.yaml";

/// Errors from reading a project config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("reading {PROJECT_CONFIG_FILE}: {0}")]
    Io(#[from] std::io::Error),

    /// The file exists but is not valid config (including unknown keys).
    #[error("parsing {PROJECT_CONFIG_FILE}: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Extra arguments appended to one terraform command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandExtraArguments {
    /// Which command the arguments apply to: `init`, `get`, `plan` or
    /// `apply`.
    pub command_name: String,
    /// The arguments, appended in order.
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Per-project configuration controlling tool version, hooks and extra
/// arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Pinned terraform version; selects the `terraform{version}` binary.
    #[serde(default)]
    pub terraform_version: Option<String>,
    /// Commands run before `terraform init`.
    #[serde(default)]
    pub pre_init: Vec<String>,
    /// Commands run before `terraform get` (pre-0.9 versions).
    #[serde(default)]
    pub pre_get: Vec<String>,
    /// Commands run before `terraform plan`.
    #[serde(default)]
    pub pre_plan: Vec<String>,
    /// Commands run after a successful plan.
    #[serde(default)]
    pub post_plan: Vec<String>,
    /// Commands run before `terraform apply`.
    #[serde(default)]
    pub pre_apply: Vec<String>,
    /// Commands run after a successful apply.
    #[serde(default)]
    pub post_apply: Vec<String>,
    /// Extra arguments per command.
    #[serde(default)]
    pub extra_arguments: Vec<CommandExtraArguments>,
}

impl ProjectConfig {
    /// Reads the config from `project_dir`, returning the default config
    /// when no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file exists but cannot be read
    /// or parsed.
    pub fn read(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join(PROJECT_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// The extra arguments configured for `command_name`, empty when none
    /// are configured.
    #[must_use]
    pub fn extra_arguments(&self, command_name: &str) -> Vec<String> {
        self.extra_arguments
            .iter()
            .find(|e| e.command_name == command_name)
            .map(|e| e.arguments.clone())
            .unwrap_or_default()
    }
}
