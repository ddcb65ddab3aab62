//! Core types for stage outputs and lifecycle.
//!
//! This module defines:
//! - `Target` - an existence-checkable output artifact
//! - `CompletionOracle` - the filesystem-only completion check
//! - `StageStatus` - the scheduling state of a stage

mod status;
mod target;

pub use status::StageStatus;
pub use target::{CompletionOracle, Target};
