//! Failure policy and aggregated failure reporting.

use crate::errors::ShellflowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// What the scheduler does with the rest of the graph after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Withhold dependents of the failed stage; disjoint branches continue.
    #[default]
    ContinueOnFailure,
    /// Dispatch nothing new after the first failure; running stages finish.
    FailFast,
}

/// Record of one failed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage id.
    pub stage: String,
    /// Error message.
    pub error: String,
    /// Error kind, e.g. `CommandExecutionError`.
    pub error_kind: String,
    /// Log files written by the stage.
    pub log_paths: Vec<PathBuf>,
    /// When the failure was observed.
    pub timestamp: DateTime<Utc>,
}

impl FailureRecord {
    /// Creates a record from a stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, error: &ShellflowError) -> Self {
        Self {
            stage: stage.into(),
            error: error.to_string(),
            error_kind: error.kind().to_string(),
            log_paths: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Sets the log paths.
    #[must_use]
    pub fn with_log_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.log_paths = paths;
        self
    }
}

/// Every failure of one run, in the order they were observed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureReport {
    /// Failure records.
    pub failures: Vec<FailureRecord>,
    /// Stages never run because an ancestor failed.
    pub withheld: Vec<String>,
}

impl FailureReport {
    /// Returns true if nothing failed and nothing was withheld.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.withheld.is_empty()
    }

    /// Returns the ids of the failed stages.
    #[must_use]
    pub fn failed_stages(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.stage.as_str()).collect()
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "all stages succeeded");
        }
        if !self.failures.is_empty() {
            writeln!(f, "{} stage(s) failed:", self.failures.len())?;
        }
        for record in &self.failures {
            writeln!(f, "  {} [{}]: {}", record.stage, record.error_kind, record.error)?;
            for log in &record.log_paths {
                writeln!(f, "    log: {}", log.display())?;
            }
        }
        if !self.withheld.is_empty() {
            writeln!(f, "{} stage(s) withheld: {}", self.withheld.len(), self.withheld.join(", "))?;
        }
        Ok(())
    }
}
