//! Graph expansion and scheduling.
//!
//! This module provides:
//! - `GraphBuilder` / `ExecutionPlan` - memoised expansion with pruning
//!   of complete stages and cycle detection
//! - `Scheduler` - bounded-worker execution with priority ordering
//! - `FailureMode` / `FailureReport` - failure policy and reporting

mod builder;
mod dag;
mod failure;

#[cfg(test)]
mod integration_tests;

pub use builder::{ExecutionPlan, GraphBuilder, PlanNode, Slot};
pub use dag::{RunReport, Scheduler};
pub use failure::{FailureMode, FailureRecord, FailureReport};
