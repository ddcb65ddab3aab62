//! Shell sessions opened by a running stage.

use super::stage_context::StageContext;
use crate::errors::{ExecutableNotFoundError, ShellflowError};
use crate::runner::{
    resolve_executable, BatchMode, CommandBatch, CommandOutcome, LogSink, ShellCommand,
    ShellRunner,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Builder for a [`RunContext`], obtained from
/// [`StageContext::setup_shell`].
#[derive(Debug)]
pub struct RunContextBuilder<'a> {
    ctx: &'a StageContext,
    run_id: String,
    commands: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    log_dir: Option<PathBuf>,
    remove_if_failed: Option<bool>,
    quiet: Option<bool>,
}

impl<'a> RunContextBuilder<'a> {
    pub(crate) fn new(ctx: &'a StageContext, run_id: String) -> Self {
        Self {
            ctx,
            run_id,
            commands: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            log_dir: None,
            remove_if_failed: None,
            quiet: None,
        }
    }

    /// Declares executables that must resolve before anything is created.
    #[must_use]
    pub fn commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Sets (and creates on build) the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Adds one environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds several environment overrides.
    #[must_use]
    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Overrides the configured log directory.
    #[must_use]
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Overrides the configured cleanup policy for this stage.
    #[must_use]
    pub fn remove_if_failed(mut self, remove: bool) -> Self {
        self.remove_if_failed = Some(remove);
        self
    }

    /// Overrides the configured quiet mode.
    #[must_use]
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = Some(quiet);
        self
    }

    /// Checks executables, prepares directories and opens the log.
    ///
    /// The executable check runs first, so a failure leaves nothing behind.
    pub async fn build(self) -> Result<RunContext, ShellflowError> {
        let ctx = self.ctx;
        let config = ctx.config();

        let mut executables = BTreeMap::new();
        for name in &self.commands {
            let path = resolve_executable(name, config).ok_or_else(|| {
                ExecutableNotFoundError::new(name.as_str(), ctx.stage_id().as_str())
            })?;
            executables.insert(name.clone(), path);
        }

        if let Some(ref cwd) = self.cwd {
            tokio::fs::create_dir_all(cwd).await?;
        }
        let log_dir = self.log_dir.unwrap_or_else(|| config.log_dir.clone());
        let log = Arc::new(LogSink::open(log_dir.join(format!("{}.sh.log", self.run_id))).await?);
        ctx.record_log_path(log.path().to_path_buf());

        if let Some(remove) = self.remove_if_failed {
            ctx.cleanup().set_enabled(remove);
        }

        let mut env = config.env.clone();
        env.extend(self.env);
        let mut runner = ShellRunner::new(
            ctx.stage_id().as_str(),
            &config.shell,
            log,
            Arc::clone(ctx.events()),
        )
        .with_env(env)
        .with_quiet(self.quiet.unwrap_or(config.quiet))
        .with_fan_out_limit(ctx.fan_out_limit());
        if let Some(cwd) = self.cwd {
            runner = runner.with_cwd(cwd);
        }

        debug!(
            stage = %ctx.stage_id(),
            run_id = %self.run_id,
            log = %runner.log_path().display(),
            "shell set up"
        );
        Ok(RunContext {
            run_id: self.run_id,
            executables,
            runner,
            ctx: ctx.clone(),
        })
    }
}

/// A shell session for one run id.
///
/// Outputs of synchronous commands are registered for removal if the stage
/// fails. Fan-out shard outputs are not, so a failed fan-out leaves the
/// shards that succeeded in place.
#[derive(Debug)]
pub struct RunContext {
    run_id: String,
    executables: BTreeMap<String, PathBuf>,
    runner: ShellRunner,
    ctx: StageContext,
}

impl RunContext {
    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Returns the log file path.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        self.runner.log_path()
    }

    /// Returns the resolved path of a declared executable.
    #[must_use]
    pub fn executable(&self, name: &str) -> Option<&Path> {
        self.executables.get(name).map(PathBuf::as_path)
    }

    /// Runs one command synchronously.
    pub async fn run_shell(
        &self,
        command: impl Into<ShellCommand>,
    ) -> Result<CommandOutcome, ShellflowError> {
        let command = command.into();
        self.ctx.cleanup().register_all(command.outputs.iter());
        self.runner.run_command(&command).await
    }

    /// Runs a batch in its declared mode.
    pub async fn run(&self, batch: &CommandBatch) -> Result<Vec<CommandOutcome>, ShellflowError> {
        if batch.mode == BatchMode::Sequential {
            self.ctx.cleanup().register_all(batch.declared_outputs());
        }
        self.runner.run_batch(batch).await
    }

    /// Appends a line to the log file.
    pub async fn log(&self, line: &str) -> Result<(), ShellflowError> {
        self.runner.log().append_line(line).await
    }
}
