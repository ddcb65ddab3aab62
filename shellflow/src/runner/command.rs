//! Commands and command batches.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One shell command string with its declared inputs and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellCommand {
    /// The command text, interpreted by the configured shell.
    pub command: String,
    /// Paths that must exist before the command runs.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// Paths that must exist after the command exits successfully.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
}

impl ShellCommand {
    /// Creates a command without declared paths.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Declares input paths.
    #[must_use]
    pub fn inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Declares a single input path.
    #[must_use]
    pub fn input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    /// Declares output paths.
    #[must_use]
    pub fn outputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.outputs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Declares a single output path.
    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(path.into());
        self
    }

    /// Returns declared inputs that do not exist.
    #[must_use]
    pub fn missing_inputs(&self) -> Vec<PathBuf> {
        missing(&self.inputs)
    }

    /// Returns declared outputs that do not exist.
    #[must_use]
    pub fn missing_outputs(&self) -> Vec<PathBuf> {
        missing(&self.outputs)
    }
}

impl From<&str> for ShellCommand {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

impl From<String> for ShellCommand {
    fn from(command: String) -> Self {
        Self::new(command)
    }
}

fn missing(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().filter(|p| !Path::exists(p)).cloned().collect()
}

/// How the commands of a batch are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Strictly in order; the first failure aborts the rest.
    #[default]
    Sequential,
    /// Concurrently; every command runs to completion and the batch joins.
    FanOut,
}

/// An ordered list of commands belonging to one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommandBatch {
    /// The commands, in declaration order.
    pub commands: Vec<ShellCommand>,
    /// Execution mode.
    #[serde(default)]
    pub mode: BatchMode,
}

impl CommandBatch {
    /// Creates a sequential batch.
    #[must_use]
    pub fn sequential<I, C>(commands: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ShellCommand>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            mode: BatchMode::Sequential,
        }
    }

    /// Creates a fan-out batch of independent shard commands.
    #[must_use]
    pub fn fan_out<I, C>(commands: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ShellCommand>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            mode: BatchMode::FanOut,
        }
    }

    /// Fans out when `asynchronous` is true, runs sequentially otherwise.
    #[must_use]
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.mode = if asynchronous {
            BatchMode::FanOut
        } else {
            BatchMode::Sequential
        };
        self
    }

    /// Returns the number of commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Returns true if the batch has no commands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Returns every declared input, deduplicated, in first-seen order.
    #[must_use]
    pub fn declared_inputs(&self) -> Vec<PathBuf> {
        dedup(self.commands.iter().flat_map(|c| c.inputs.iter()))
    }

    /// Returns every declared output, deduplicated, in first-seen order.
    #[must_use]
    pub fn declared_outputs(&self) -> Vec<PathBuf> {
        dedup(self.commands.iter().flat_map(|c| c.outputs.iter()))
    }
}

impl From<ShellCommand> for CommandBatch {
    fn from(command: ShellCommand) -> Self {
        Self::sequential([command])
    }
}

fn dedup<'a>(paths: impl Iterator<Item = &'a PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths.filter(|p| seen.insert(*p)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_command_builder() {
        let cmd = ShellCommand::new("gatk MergeVcfs")
            .inputs(["/o/a.vcf.gz", "/o/b.vcf.gz"])
            .output("/o/merged.vcf.gz");

        assert_eq!(cmd.inputs.len(), 2);
        assert_eq!(cmd.outputs, vec![PathBuf::from("/o/merged.vcf.gz")]);
    }

    #[test]
    fn test_missing_paths() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present");
        fs::write(&present, "").unwrap();
        let absent = dir.path().join("absent");

        let cmd = ShellCommand::new("cat")
            .inputs([&present, &absent])
            .output(&present);
        assert_eq!(cmd.missing_inputs(), vec![absent]);
        assert!(cmd.missing_outputs().is_empty());
    }

    #[test]
    fn test_batch_modes() {
        let batch = CommandBatch::sequential(["a", "b"]);
        assert_eq!(batch.mode, BatchMode::Sequential);
        assert_eq!(batch.len(), 2);

        let batch = CommandBatch::fan_out(["a"]);
        assert_eq!(batch.mode, BatchMode::FanOut);

        let batch = CommandBatch::sequential(["a", "b"]).asynchronous(true);
        assert_eq!(batch.mode, BatchMode::FanOut);
        assert!(CommandBatch::default().is_empty());
    }

    #[test]
    fn test_declared_paths_dedup() {
        let batch = CommandBatch::fan_out([
            ShellCommand::new("x").input("/ref.fa").output("/s0.vcf.gz"),
            ShellCommand::new("y").input("/ref.fa").output("/s1.vcf.gz"),
        ]);
        assert_eq!(batch.declared_inputs(), vec![PathBuf::from("/ref.fa")]);
        assert_eq!(batch.declared_outputs().len(), 2);
    }
}
