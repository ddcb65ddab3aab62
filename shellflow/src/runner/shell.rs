//! Child-process execution through a shell.

use super::command::{BatchMode, CommandBatch, ShellCommand};
use crate::config::ShellConfig;
use crate::errors::{CommandExecutionError, MissingInputError, ShellflowError};
use crate::events::EventSink;
use crate::observability::SpanTimer;
use futures::future::join_all;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info};

/// Append-only log file shared by every command of one run id.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogSink {
    /// Opens (creating if needed) the log file at `path`.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ShellflowError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a text block. Blocks from concurrent writers never interleave.
    pub async fn append(&self, text: &str) -> Result<(), ShellflowError> {
        let mut file = self.file.lock().await;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Appends one line.
    pub async fn append_line(&self, line: &str) -> Result<(), ShellflowError> {
        self.append(&format!("{line}\n")).await
    }
}

/// Result of one successful command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    /// The command text.
    pub command: String,
    /// Exit code reported by the shell.
    pub exit_code: i32,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

/// Resolves a declared executable to a file on disk.
///
/// Logical names configured in [`ShellConfig::executables`] are mapped
/// first. Names containing a path separator must exist as given; bare names
/// are searched on `PATH`.
#[must_use]
pub fn resolve_executable(name: &str, config: &ShellConfig) -> Option<PathBuf> {
    let candidate = config.executable(name);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then_some(candidate);
    }
    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(&candidate))
        .find(|p| p.is_file())
}

/// Runs commands for one stage through a shell, writing their output to a
/// shared log.
#[derive(Clone)]
pub struct ShellRunner {
    stage: String,
    shell: PathBuf,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    quiet: bool,
    fan_out_limit: Option<usize>,
    log: Arc<LogSink>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ShellRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellRunner")
            .field("stage", &self.stage)
            .field("shell", &self.shell)
            .field("cwd", &self.cwd)
            .field("quiet", &self.quiet)
            .field("log", &self.log.path())
            .finish()
    }
}

impl ShellRunner {
    /// Creates a runner writing to `log`.
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        shell: impl Into<PathBuf>,
        log: Arc<LogSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            stage: stage.into(),
            shell: shell.into(),
            cwd: None,
            env: BTreeMap::new(),
            quiet: true,
            fan_out_limit: None,
            log,
            events,
        }
    }

    /// Sets the working directory of every command.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Overlays environment variables on the inherited environment.
    #[must_use]
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Sets quiet mode. Unless quiet, output is echoed to the console as it
    /// arrives; it is always written to the log.
    #[must_use]
    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Bounds the number of concurrent shard commands in a fan-out.
    #[must_use]
    pub fn with_fan_out_limit(mut self, limit: Option<usize>) -> Self {
        self.fan_out_limit = limit;
        self
    }

    /// Returns the log path.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Returns the shared log sink.
    #[must_use]
    pub fn log(&self) -> &Arc<LogSink> {
        &self.log
    }

    /// Runs a batch in its declared mode.
    pub async fn run_batch(
        &self,
        batch: &CommandBatch,
    ) -> Result<Vec<CommandOutcome>, ShellflowError> {
        match batch.mode {
            BatchMode::Sequential => self.run_sequential(&batch.commands).await,
            BatchMode::FanOut => self.run_fan_out(&batch.commands).await,
        }
    }

    /// Runs commands strictly in order, stopping at the first failure.
    pub async fn run_sequential(
        &self,
        commands: &[ShellCommand],
    ) -> Result<Vec<CommandOutcome>, ShellflowError> {
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            outcomes.push(self.run_command(command).await?);
        }
        Ok(outcomes)
    }

    /// Runs independent shard commands concurrently and joins them.
    ///
    /// Every shard's inputs are checked before any shard starts. A failing
    /// shard never interrupts its siblings; once all have finished, the
    /// first failure in declaration order is returned.
    pub async fn run_fan_out(
        &self,
        commands: &[ShellCommand],
    ) -> Result<Vec<CommandOutcome>, ShellflowError> {
        let missing: Vec<PathBuf> = commands.iter().flat_map(ShellCommand::missing_inputs).collect();
        if !missing.is_empty() {
            return Err(MissingInputError::new(missing, &self.stage).into());
        }

        let permits = self.fan_out_limit.unwrap_or(commands.len()).max(1);
        let semaphore = Semaphore::new(permits);
        debug!(stage = %self.stage, shards = commands.len(), permits, "fanning out");

        let results = join_all(commands.iter().map(|command| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|e| ShellflowError::Internal(format!("fan-out semaphore closed: {e}")))?;
                self.run_command(command).await
            }
        }))
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        let mut first_failure = None;
        for (shard, result) in results.into_iter().enumerate() {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    error!(stage = %self.stage, shard, error = %e, "shard failed");
                    if first_failure.is_none() {
                        first_failure = Some(e);
                    }
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(outcomes),
        }
    }

    /// Runs one command: checks its inputs, executes it, then checks its
    /// outputs.
    pub async fn run_command(
        &self,
        command: &ShellCommand,
    ) -> Result<CommandOutcome, ShellflowError> {
        let missing = command.missing_inputs();
        if !missing.is_empty() {
            return Err(MissingInputError::new(missing, &self.stage).into());
        }

        let timer = SpanTimer::start(&command.command);
        info!(stage = %self.stage, command = %command.command, "running command");
        self.events
            .emit(
                "command.started",
                Some(json!({"stage": self.stage, "command": command.command})),
            )
            .await;

        let mut process = Command::new(&self.shell);
        process
            .arg("-c")
            .arg(&command.command)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            process.current_dir(cwd);
        }

        self.log
            .append_line(&format!(
                ">>> {} [{}] $ {}",
                chrono::Utc::now().to_rfc3339(),
                self.stage,
                command.command
            ))
            .await?;
        let mut child = process.spawn()?;
        let (out_pipe, err_pipe) = (child.stdout.take(), child.stderr.take());
        let echo = !self.quiet;
        let (stdout, stderr, status) = tokio::try_join!(
            capture(out_pipe, echo.then(tokio::io::stdout)),
            capture(err_pipe, echo.then(tokio::io::stderr)),
            child.wait(),
        )?;
        let duration_ms = timer.elapsed_ms();

        let mut block = String::new();
        block.push_str(&String::from_utf8_lossy(&stdout));
        block.push_str(&String::from_utf8_lossy(&stderr));
        if !block.is_empty() && !block.ends_with('\n') {
            block.push('\n');
        }
        block.push_str(&format!(
            "<<< {} ({duration_ms:.1} ms)\n",
            describe_status(&status)
        ));
        self.log.append(&block).await?;

        self.events
            .emit(
                "command.finished",
                Some(json!({
                    "stage": self.stage,
                    "command": command.command,
                    "exit_code": status.code(),
                    "duration_ms": duration_ms,
                })),
            )
            .await;

        if !status.success() {
            return Err(CommandExecutionError::exited(
                &self.stage,
                &command.command,
                status.code(),
                termination_signal(&status),
            )
            .with_log_path(self.log.path())
            .into());
        }

        let missing = command.missing_outputs();
        if !missing.is_empty() {
            return Err(
                CommandExecutionError::outputs_missing(&self.stage, &command.command, missing)
                    .with_log_path(self.log.path())
                    .into(),
            );
        }

        Ok(CommandOutcome {
            command: command.command.clone(),
            exit_code: status.code().unwrap_or_default(),
            duration_ms,
        })
    }
}

/// Drains a child pipe, echoing each chunk to `echo` as it arrives.
///
/// The captured bytes are returned so the caller can write them to the log
/// as one block once the process has exited.
async fn capture<R, W>(source: Option<R>, mut echo: Option<W>) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(mut source) = source else {
        return Ok(Vec::new());
    };
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&chunk[..n]);
        if let Some(ref mut out) = echo {
            out.write_all(&chunk[..n]).await?;
            out.flush().await?;
        }
    }
    Ok(captured)
}

fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), termination_signal(status)) {
        (Some(code), _) => format!("exit status {code}"),
        (None, Some(signal)) => format!("killed by signal {signal}"),
        (None, None) => "no exit status".to_string(),
    }
}

#[cfg(unix)]
fn termination_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn termination_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
