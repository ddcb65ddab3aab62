//! Stage status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The scheduling state of a stage within one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Ran successfully and its outputs passed the completion check.
    Complete,
    /// Already complete before it was scheduled; never ran.
    Pruned,
    /// Its run procedure failed.
    Failed,
    /// Never dispatched because an ancestor failed.
    Withheld,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Pruned => write!(f, "pruned"),
            Self::Failed => write!(f, "failed"),
            Self::Withheld => write!(f, "withheld"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Pruned | Self::Failed | Self::Withheld
        )
    }

    /// Returns true if dependents may rely on this stage's outputs.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Complete | Self::Pruned)
    }

    /// Returns true if dependents must be withheld.
    #[must_use]
    pub fn blocks_dependents(&self) -> bool {
        matches!(self, Self::Failed | Self::Withheld)
    }
}
