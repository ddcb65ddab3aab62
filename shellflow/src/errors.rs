//! Error types for the shellflow engine.
//!
//! Every failure the engine can surface maps to one variant of
//! [`ShellflowError`]. None of them are retried by the engine: re-invoking the
//! pipeline is cheap because complete stages are skipped.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for shellflow operations.
#[derive(Debug, Error)]
pub enum ShellflowError {
    /// A declared executable could not be resolved before any work started.
    #[error("{0}")]
    ExecutableNotFound(#[from] ExecutableNotFoundError),

    /// A declared input path was missing when a command was about to run.
    #[error("{0}")]
    MissingInput(#[from] MissingInputError),

    /// A command exited non-zero or left declared outputs missing.
    #[error("{0}")]
    CommandExecution(#[from] CommandExecutionError),

    /// A cycle was detected while expanding the stage graph.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// The configuration was rejected at graph-build time.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error raised by user-supplied stage code.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ShellflowError {
    /// Returns a short, stable name for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutableNotFound(_) => "ExecutableNotFoundError",
            Self::MissingInput(_) => "MissingInputError",
            Self::CommandExecution(_) => "CommandExecutionError",
            Self::CycleDetected(_) => "CycleError",
            Self::Config(_) => "ConfigError",
            Self::Internal(_) => "InternalError",
            Self::Io(_) => "IoError",
            Self::Other(_) => "StageError",
        }
    }
}

/// Metadata attached to build-time errors for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "SHELLFLOW-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a declared executable cannot be resolved.
#[derive(Debug, Clone, Error)]
#[error("Executable not found for stage '{stage}': {command}")]
pub struct ExecutableNotFoundError {
    /// The command as it was declared.
    pub command: String,
    /// The stage that declared it.
    pub stage: String,
}

impl ExecutableNotFoundError {
    /// Creates a new executable-not-found error.
    #[must_use]
    pub fn new(command: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            stage: stage.into(),
        }
    }
}

/// Error raised when declared inputs are absent before a command runs.
#[derive(Debug, Clone, Error)]
#[error("Missing input for stage '{stage}': {}", display_paths(.paths))]
pub struct MissingInputError {
    /// The missing paths.
    pub paths: Vec<PathBuf>,
    /// The stage whose command declared them.
    pub stage: String,
}

impl MissingInputError {
    /// Creates a new missing-input error.
    #[must_use]
    pub fn new(paths: Vec<PathBuf>, stage: impl Into<String>) -> Self {
        Self {
            paths,
            stage: stage.into(),
        }
    }
}

/// Error raised when a child process fails or leaves outputs missing.
#[derive(Debug, Clone, Error)]
#[error("{}", self.describe())]
pub struct CommandExecutionError {
    /// The stage that ran the command.
    pub stage: String,
    /// The command text.
    pub command: String,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
    /// Declared outputs that did not exist after execution.
    pub missing_outputs: Vec<PathBuf>,
    /// The log file capturing the command's output.
    pub log_path: Option<PathBuf>,
}

impl CommandExecutionError {
    /// Creates an error for a process that exited unsuccessfully.
    #[must_use]
    pub fn exited(
        stage: impl Into<String>,
        command: impl Into<String>,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) -> Self {
        Self {
            stage: stage.into(),
            command: command.into(),
            exit_code,
            signal,
            missing_outputs: Vec::new(),
            log_path: None,
        }
    }

    /// Creates an error for outputs missing after a successful exit.
    #[must_use]
    pub fn outputs_missing(
        stage: impl Into<String>,
        command: impl Into<String>,
        missing_outputs: Vec<PathBuf>,
    ) -> Self {
        Self {
            stage: stage.into(),
            command: command.into(),
            exit_code: Some(0),
            signal: None,
            missing_outputs,
            log_path: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    fn describe(&self) -> String {
        let mut msg = format!("Command failed in stage '{}': {}", self.stage, self.command);
        if let Some(signal) = self.signal {
            msg.push_str(&format!(" (terminated by signal {signal})"));
        } else if let Some(code) = self.exit_code.filter(|c| *c != 0) {
            msg.push_str(&format!(" (exit code {code})"));
        } else if self.exit_code.is_none() {
            msg.push_str(" (no exit status)");
        }
        if !self.missing_outputs.is_empty() {
            msg.push_str(&format!(
                "; missing outputs: {}",
                display_paths(&self.missing_outputs)
            ));
        }
        if let Some(ref log) = self.log_path {
            msg.push_str(&format!("; see {}", log.display()));
        }
        msg
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stage ids forming the cycle.
    pub cycle_path: Vec<String>,
    /// Error info.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            "SHELLFLOW-CYCLE",
            format!("Stage graph contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the requires edges in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when configuration is invalid.
#[derive(Debug, Clone, Error)]
#[error("Invalid configuration: {message}")]
pub struct ConfigError {
    /// The error message.
    pub message: String,
    /// Error info.
    pub error_info: ErrorInfo,
}

impl ConfigError {
    /// Creates a new configuration error for a field.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        let message = message.into();
        Self {
            error_info: ErrorInfo::new("SHELLFLOW-CONFIG", message.clone())
                .with_context_entry("field", field),
            message,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
