//! Test helpers.
//!
//! Stages and fixtures for exercising the engine without a real pipeline.

mod fixtures;
mod mocks;

pub use fixtures::{engine_config, shell_config, touch_stage};
pub use mocks::{CountingStage, CyclicStage, FailingStage};
