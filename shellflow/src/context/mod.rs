//! Per-stage execution state.
//!
//! This module provides:
//! - `StageContext` - the handle passed to [`Stage::run`](crate::stages::Stage::run)
//! - `RunContext` - a shell session with a log file and an executable check
//! - `CleanupRegistry` - outputs removed when the stage fails

mod cleanup;
mod run_context;
mod stage_context;

pub use cleanup::CleanupRegistry;
pub use run_context::{RunContext, RunContextBuilder};
pub use stage_context::StageContext;
