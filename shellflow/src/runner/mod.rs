//! Shell command execution.
//!
//! This module provides:
//! - `ShellCommand` / `CommandBatch` - commands annotated with the paths
//!   they read and write
//! - `ShellRunner` - spawns commands through a shell, captures their output
//!   and verifies declared inputs and outputs

mod command;
mod shell;

pub use command::{BatchMode, CommandBatch, ShellCommand};
pub use shell::{resolve_executable, CommandOutcome, LogSink, ShellRunner};
