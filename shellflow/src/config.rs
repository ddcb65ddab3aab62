//! Typed configuration for the engine and its shell runner.
//!
//! Configuration is validated once, when a [`Scheduler`](crate::pipeline::Scheduler)
//! is built, never looked up by string key at run time.

use crate::errors::{ConfigError, ShellflowError};
use crate::pipeline::FailureMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration shared by every shell invocation of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Directory receiving one log file per run id.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Suppress echoing subprocess output to the console.
    #[serde(default = "default_quiet")]
    pub quiet: bool,
    /// Delete declared outputs of a stage that fails.
    #[serde(default = "default_remove_if_failed")]
    pub remove_if_failed: bool,
    /// Shell used to interpret command strings.
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    /// Environment overrides applied to every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Logical tool names mapped to executable paths.
    #[serde(default)]
    pub executables: BTreeMap<String, PathBuf>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_quiet() -> bool {
    true
}

fn default_remove_if_failed() -> bool {
    true
}

fn default_shell() -> PathBuf {
    PathBuf::from("/bin/bash")
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            quiet: default_quiet(),
            remove_if_failed: default_remove_if_failed(),
            shell: default_shell(),
            env: BTreeMap::new(),
            executables: BTreeMap::new(),
        }
    }
}

impl ShellConfig {
    /// Creates a shell configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the log directory.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    /// Sets quiet mode.
    #[must_use]
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Sets the cleanup-on-failure policy.
    #[must_use]
    pub fn with_remove_if_failed(mut self, remove: bool) -> Self {
        self.remove_if_failed = remove;
        self
    }

    /// Sets the shell binary.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Registers the path of a logical tool.
    #[must_use]
    pub fn with_executable(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.executables.insert(name.into(), path.into());
        self
    }

    /// Returns the configured path for a tool, or the name itself so it is
    /// looked up on `PATH`.
    #[must_use]
    pub fn executable(&self, name: &str) -> PathBuf {
        self.executables
            .get(name)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(name))
    }

    /// Validates the shell configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.as_os_str().is_empty() {
            return Err(ConfigError::new("shell", "shell path cannot be empty"));
        }
        if let Some((name, _)) = self
            .executables
            .iter()
            .find(|(_, path)| path.as_os_str().is_empty())
        {
            return Err(ConfigError::new(
                "executables",
                format!("executable '{name}' has an empty path"),
            ));
        }
        Ok(())
    }
}

/// Configuration of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of stages running at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// What to do with the rest of the graph after a failure.
    #[serde(default)]
    pub failure_mode: FailureMode,
    /// Maximum concurrent shard commands within one fan-out; unbounded if unset.
    #[serde(default)]
    pub fan_out_limit: Option<usize>,
    /// Shell settings.
    #[serde(default)]
    pub shell: ShellConfig,
}

fn default_max_workers() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            failure_mode: FailureMode::default(),
            fan_out_limit: None,
            shell: ShellConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates an engine configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker bound.
    #[must_use]
    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    /// Sets the failure mode.
    #[must_use]
    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Bounds fan-out concurrency.
    #[must_use]
    pub fn with_fan_out_limit(mut self, n: usize) -> Self {
        self.fan_out_limit = Some(n);
        self
    }

    /// Sets the shell configuration.
    #[must_use]
    pub fn with_shell(mut self, shell: ShellConfig) -> Self {
        self.shell = shell;
        self
    }

    /// Parses a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, ShellflowError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::new("<root>", format!("malformed configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ShellflowError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::new("max_workers", "max_workers must be at least 1"));
        }
        if self.fan_out_limit == Some(0) {
            return Err(ConfigError::new(
                "fan_out_limit",
                "fan_out_limit must be at least 1 when set",
            ));
        }
        self.shell.validate()
    }
}
