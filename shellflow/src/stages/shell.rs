//! Declarative stages that run shell command batches.

use super::{Stage, StageInputs, StageRef};
use crate::context::StageContext;
use crate::core::Target;
use crate::errors::{MissingInputError, ShellflowError};
use crate::naming::StageId;
use crate::runner::CommandBatch;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::path::PathBuf;

/// How a shell stage sets up its run context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellSettings {
    /// Log file key; the stage id when unset.
    pub run_id: Option<String>,
    /// Executables that must resolve before anything runs.
    pub executables: Vec<String>,
    /// Working directory of every command.
    pub cwd: Option<PathBuf>,
    /// Environment overrides for this stage.
    pub env: BTreeMap<String, String>,
}

impl ShellSettings {
    /// Opens a run context for `ctx` and runs `batches` in order.
    pub async fn execute(
        &self,
        ctx: &StageContext,
        batches: &[CommandBatch],
    ) -> Result<(), ShellflowError> {
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| ctx.stage_id().to_string());
        let mut builder = ctx
            .setup_shell(run_id)
            .commands(self.executables.iter().cloned())
            .envs(self.env.clone());
        if let Some(ref cwd) = self.cwd {
            builder = builder.cwd(cwd);
        }
        let run = builder.build().await?;
        for batch in batches {
            run.run(batch).await?;
        }
        Ok(())
    }
}

/// A stage with fixed outputs and a fixed list of command batches.
#[derive(Debug, Clone)]
pub struct ShellStage {
    id: StageId,
    priority: i32,
    dependencies: Vec<StageRef>,
    outputs: Vec<Target>,
    batches: Vec<CommandBatch>,
    shell: ShellSettings,
}

impl ShellStage {
    /// Creates a stage with no outputs, commands or dependencies.
    #[must_use]
    pub fn new(id: impl Into<StageId>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            dependencies: Vec::new(),
            outputs: Vec::new(),
            batches: Vec::new(),
            shell: ShellSettings::default(),
        }
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

    /// Declares an output.
    #[must_use]
    pub fn output(mut self, target: impl Into<Target>) -> Self {
        self.outputs.push(target.into());
        self
    }

    /// Appends a command batch.
    #[must_use]
    pub fn batch(mut self, batch: impl Into<CommandBatch>) -> Self {
        self.batches.push(batch.into());
        self
    }

    /// Declares an executable to check before running.
    #[must_use]
    pub fn executable(mut self, name: impl Into<String>) -> Self {
        self.shell.executables.push(name.into());
        self
    }

    /// Sets the log key.
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.shell.run_id = Some(run_id.into());
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.shell.cwd = Some(cwd.into());
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.shell.env.insert(key.into(), value.into());
        self
    }

    /// Wraps the stage in a shared handle.
    #[must_use]
    pub fn into_ref(self) -> StageRef {
        std::sync::Arc::new(self)
    }
}

#[async_trait]
impl Stage for ShellStage {
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
        self.shell.execute(ctx, &self.batches).await
    }
}

/// A stage whose outputs and commands are derived from its inputs.
pub struct FnStage<O, C>
where
    O: Fn(&StageInputs) -> Vec<Target> + Send + Sync,
    C: Fn(&StageContext) -> Vec<CommandBatch> + Send + Sync,
{
    id: StageId,
    priority: i32,
    dependencies: Vec<StageRef>,
    outputs: O,
    commands: C,
    shell: ShellSettings,
}

impl<O, C> FnStage<O, C>
where
    O: Fn(&StageInputs) -> Vec<Target> + Send + Sync,
    C: Fn(&StageContext) -> Vec<CommandBatch> + Send + Sync,
{
    /// Creates a function-based stage.
    pub fn new(id: impl Into<StageId>, outputs: O, commands: C) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            dependencies: Vec::new(),
            outputs,
            commands,
            shell: ShellSettings::default(),
        }
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

    /// Replaces the shell settings.
    #[must_use]
    pub fn with_shell(mut self, shell: ShellSettings) -> Self {
        self.shell = shell;
        self
    }
}

impl<O, C> Debug for FnStage<O, C>
where
    O: Fn(&StageInputs) -> Vec<Target> + Send + Sync,
    C: Fn(&StageContext) -> Vec<CommandBatch> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

#[async_trait]
impl<O, C> Stage for FnStage<O, C>
where
    O: Fn(&StageInputs) -> Vec<Target> + Send + Sync,
    C: Fn(&StageContext) -> Vec<CommandBatch> + Send + Sync,
{
    fn id(&self) -> StageId {
        self.id.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn dependencies(&self) -> Vec<StageRef> {
        self.dependencies.clone()
    }

    fn outputs(&self, inputs: &StageInputs) -> Vec<Target> {
        (self.outputs)(inputs)
    }

    async fn run(&self, ctx: &StageContext) -> Result<(), ShellflowError> {
        let batches = (self.commands)(ctx);
        self.shell.execute(ctx, &batches).await
    }
}

/// A stage without dependencies whose outputs are an external resource.
///
/// With a fetch batch the stage produces its targets; without one it can
/// only be complete already, and running it reports the missing paths.
#[derive(Debug, Clone)]
pub struct SourceStage {
    id: StageId,
    priority: i32,
    targets: Vec<Target>,
    fetch: Option<CommandBatch>,
    shell: ShellSettings,
}

impl SourceStage {
    /// Creates a source over existing targets.
    #[must_use]
    pub fn new<I, T>(id: impl Into<StageId>, targets: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Target>,
    {
        Self {
            id: id.into(),
            priority: 0,
            targets: targets.into_iter().map(Into::into).collect(),
            fetch: None,
            shell: ShellSettings::default(),
        }
    }

    /// Sets the batch that produces the targets.
    #[must_use]
    pub fn with_fetch(mut self, batch: impl Into<CommandBatch>) -> Self {
        self.fetch = Some(batch.into());
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Replaces the shell settings used by the fetch batch.
    #[must_use]
    pub fn with_shell(mut self, shell: ShellSettings) -> Self {
        self.shell = shell;
        self
    }
}

#[async_trait]
impl Stage for SourceStage {
    fn id(&self) -> StageId {
        self.id.clone()
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn outputs(&self, _inputs: &StageInputs) -> Vec<Target> {
        self.targets.clone()
    }

    async fn run(&self, ctx: &StageContext) -> Result<(), ShellflowError> {
        match self.fetch {
            Some(ref batch) => self.shell.execute(ctx, std::slice::from_ref(batch)).await,
            None => {
                let missing: Vec<PathBuf> = self.targets.iter().flat_map(Target::missing).collect();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(MissingInputError::new(missing, self.id.as_str()).into())
                }
            }
        }
    }
}
