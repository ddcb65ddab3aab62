//! # Shellflow
//!
//! A task-graph engine for pipelines of shell commands whose outputs are
//! files on disk.
//!
//! Shellflow provides:
//!
//! - **Existence-based completion**: a stage is done when its outputs exist
//! - **Demand-driven expansion**: only stages a requested target needs are
//!   scheduled, and complete subtrees are never visited
//! - **Bounded parallelism**: ready stages run by priority, then discovery order
//! - **Shell sessions**: logged commands with input and output checks,
//!   sequential or fanned out
//! - **Failure isolation**: a failed stage withholds its dependents while
//!   independent branches keep running
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shellflow::prelude::*;
//!
//! let align = ShellStage::new("align")
//!     .output(Target::indexed("/out/t.cram", ".crai"))
//!     .executable("samtools")
//!     .batch(ShellCommand::new("bwa mem ... | samtools sort -o /out/t.cram")
//!         .output("/out/t.cram"))
//!     .into_ref();
//!
//! let scheduler = Scheduler::new(EngineConfig::new().with_max_workers(4))?;
//! let report = scheduler.run(&[align]).await?;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod naming;
pub mod observability;
pub mod pipeline;
pub mod runner;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, ShellConfig};
    pub use crate::context::{RunContext, StageContext};
    pub use crate::core::{CompletionOracle, StageStatus, Target};
    pub use crate::errors::{
        CommandExecutionError, CycleDetectedError, ExecutableNotFoundError,
        MissingInputError, ShellflowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::naming::{MatchedId, StageId};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{FailureMode, RunReport, Scheduler};
    pub use crate::runner::{BatchMode, CommandBatch, ShellCommand};
    pub use crate::stages::{FnStage, ShellStage, SourceStage, Stage, StageInputs, StageRef};
}
