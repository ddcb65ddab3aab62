//! Stage trait and implementations.
//!
//! A stage is a unit of work producing declared filesystem outputs from the
//! outputs of the stages it requires. Stages are immutable descriptions; the
//! scheduler tracks their status.

mod inputs;
mod shell;

pub use inputs::StageInputs;
pub use shell::{FnStage, ShellSettings, ShellStage, SourceStage};

use crate::context::StageContext;
use crate::core::{CompletionOracle, Target};
use crate::errors::ShellflowError;
use crate::naming::StageId;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Shared handle to a stage.
pub type StageRef = Arc<dyn Stage>;

/// Trait for pipeline stages.
///
/// Dependencies are wired at construction time: a stage owns handles to the
/// stages it requires and returns them from [`Stage::dependencies`].
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the identity of the stage. Equal ids denote the same node.
    fn id(&self) -> StageId;

    /// Returns the dispatch priority; higher runs first among ready stages.
    fn priority(&self) -> i32 {
        0
    }

    /// Returns the stages this one requires, in declaration order.
    fn dependencies(&self) -> Vec<StageRef> {
        Vec::new()
    }

    /// Returns the declared outputs, given the outputs of the dependencies.
    fn outputs(&self, inputs: &StageInputs) -> Vec<Target>;

    /// Returns true if the stage has nothing left to do.
    fn complete(&self, outputs: &[Target]) -> bool {
        CompletionOracle::is_complete(outputs)
    }

    /// Returns additional stages discovered once the dependencies are
    /// complete. They are scheduled before [`Stage::run`] and their outputs
    /// are exposed through [`StageContext::dynamic_inputs`].
    fn plan(&self, _inputs: &StageInputs) -> Result<Vec<StageRef>, ShellflowError> {
        Ok(Vec::new())
    }

    /// Executes the stage.
    async fn run(&self, ctx: &StageContext) -> Result<(), ShellflowError>;
}
