//! In-process stages with observable behaviour.

use crate::context::StageContext;
use crate::core::Target;
use crate::errors::{MissingInputError, ShellflowError};
use crate::naming::StageId;
use crate::runner::ShellCommand;
use crate::stages::{Stage, StageInputs, StageRef};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A stage that writes its outputs in-process and counts its runs.
///
/// Clones share the counter and the journal, so a test can keep one clone
/// and hand another to the scheduler.
#[derive(Debug, Clone)]
pub struct CountingStage {
    id: StageId,
    priority: i32,
    dependencies: Vec<StageRef>,
    outputs: Vec<Target>,
    delay: Duration,
    write: bool,
    runs: Arc<AtomicUsize>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl CountingStage {
    /// Creates a stage with no outputs.
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: StageId::new(id),
            priority: 0,
            dependencies: Vec::new(),
            outputs: Vec::new(),
            delay: Duration::ZERO,
            write: true,
            runs: Arc::new(AtomicUsize::new(0)),
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Declares an output file.
    #[must_use]
    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.outputs.push(Target::new(path));
        self
    }

    /// Declares an output target.
    #[must_use]
    pub fn target(mut self, target: Target) -> Self {
        self.outputs.push(target);
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn requires(mut self, stage: StageRef) -> Self {
        self.dependencies.push(stage);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sleeps before writing outputs.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shares a journal with other stages.
    #[must_use]
    pub fn with_journal(mut self, journal: Arc<Mutex<Vec<String>>>) -> Self {
        self.journal = journal;
        self
    }

    /// Runs without writing any output.
    #[must_use]
    pub fn without_writing(mut self) -> Self {
        self.write = false;
        self
    }

    /// Returns how many times the stage ran.
    #[must_use]
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Returns the journal of `start:<id>` / `finish:<id>` entries.
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Wraps a clone in a shared handle.
    #[must_use]
    pub fn into_ref(self) -> StageRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Stage for CountingStage {
    fn id(&self) -> StageId {
        self.id.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn dependencies(&self) -> Vec<StageRef> {
        self.dependencies.clone()
    }

    fn outputs(&self, _inputs: &StageInputs) -> Vec<Target> {
        self.outputs.clone()
    }

    async fn run(&self, ctx: &StageContext) -> Result<(), ShellflowError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push(format!("start:{}", self.id));

        let missing: Vec<PathBuf> = ctx.inputs().paths().into_iter().filter(|p| !p.exists()).collect();
        if !missing.is_empty() {
            return Err(MissingInputError::new(missing, self.id.as_str()).into());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.write {
            for path in self.outputs.iter().flat_map(Target::paths) {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(path, self.id.as_str()).await?;
            }
        }

        self.journal.lock().push(format!("finish:{}", self.id));
        Ok(())
    }
}

/// A shell stage that writes part of its output and then exits non-zero.
#[derive(Debug, Clone)]
pub struct FailingStage {
    id: StageId,
    outputs: Vec<PathBuf>,
    partial: bool,
    dependencies: Vec<StageRef>,
}

impl FailingStage {
    /// Creates a failing stage declaring `outputs`.
    #[must_use]
    pub fn new(id: &str, outputs: Vec<PathBuf>) -> Self {
        Self {
            id: StageId::new(id),
            outputs,
            partial: true,
            dependencies: Vec::new(),
        }
    }

    /// Fails without writing anything.
    #[must_use]
    pub fn without_partial_output(mut self) -> Self {
        self.partial = false;
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn requires(mut self, stage: StageRef) -> Self {
        self.dependencies.push(stage);
        self
    }

    /// Wraps the stage in a shared handle.
    #[must_use]
    pub fn into_ref(self) -> StageRef {
        Arc::new(self)
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn id(&self) -> StageId {
        self.id.clone()
    }

    fn dependencies(&self) -> Vec<StageRef> {
        self.dependencies.clone()
    }

    fn outputs(&self, _inputs: &StageInputs) -> Vec<Target> {
        self.outputs.iter().map(Target::new).collect()
    }

    async fn run(&self, ctx: &StageContext) -> Result<(), ShellflowError> {
        let run = ctx.setup_shell(self.id.as_str()).build().await?;
        let command = match (self.partial, self.outputs.first()) {
            (true, Some(first)) => format!("echo partial > {} && exit 1", first.display()),
            _ => "exit 1".to_string(),
        };
        run.run_shell(ShellCommand::new(command).outputs(self.outputs.iter()))
            .await?;
        Ok(())
    }
}

/// A stage that requires a fresh instance of its partner, which in turn
/// requires it back.
#[derive(Debug, Clone)]
pub struct CyclicStage {
    name: String,
    partner: String,
}

impl CyclicStage {
    /// Creates one half of a two-stage cycle.
    #[must_use]
    pub fn new(name: &str, partner: &str) -> Self {
        Self {
            name: name.to_string(),
            partner: partner.to_string(),
        }
    }
}

#[async_trait]
impl Stage for CyclicStage {
    fn id(&self) -> StageId {
        StageId::new(self.name.as_str())
    }

    fn dependencies(&self) -> Vec<StageRef> {
        vec![Arc::new(CyclicStage::new(&self.partner, &self.name))]
    }

    fn outputs(&self, _inputs: &StageInputs) -> Vec<Target> {
        vec![Target::new(format!("/nonexistent/{}.out", self.name))]
    }

    async fn run(&self, _ctx: &StageContext) -> Result<(), ShellflowError> {
        Ok(())
    }
}
