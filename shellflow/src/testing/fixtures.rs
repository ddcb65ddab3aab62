//! Configuration and stage fixtures.

use crate::config::{EngineConfig, ShellConfig};
use crate::core::Target;
use crate::runner::ShellCommand;
use crate::stages::ShellStage;
use std::path::{Path, PathBuf};

/// Shell configuration writing logs under `dir/logs` and using `/bin/sh`.
#[must_use]
pub fn shell_config(dir: &Path) -> ShellConfig {
    ShellConfig::new()
        .with_log_dir(dir.join("logs"))
        .with_shell("/bin/sh")
}

/// Engine configuration over [`shell_config`] with `workers` workers.
#[must_use]
pub fn engine_config(dir: &Path, workers: usize) -> EngineConfig {
    EngineConfig::new()
        .with_max_workers(workers)
        .with_shell(shell_config(dir))
}

/// A shell stage that creates each of `outputs` with `touch`.
#[must_use]
pub fn touch_stage(id: &str, outputs: &[PathBuf]) -> ShellStage {
    let command = format!(
        "touch {}",
        outputs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );
    outputs
        .iter()
        .fold(ShellStage::new(id), |stage, p| stage.output(Target::new(p)))
        .batch(ShellCommand::new(command).outputs(outputs.iter()))
}
