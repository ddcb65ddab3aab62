//! `tracing` integration: subscriber setup, stage spans and timing.

use crate::errors::{ConfigError, ShellflowError};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber.
///
/// `RUST_LOG` overrides `level` when set. Calling this more than once is not
/// an error; later calls leave the first subscriber in place.
pub fn init_tracing(level: &str, json: bool) -> Result<(), ShellflowError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| ConfigError::new("log_level", format!("invalid log level '{level}': {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // try_init only fails when a global subscriber already exists.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    Ok(())
}

/// Returns the span every stage execution runs in.
#[must_use]
pub fn stage_span(stage: &str, priority: i32) -> tracing::Span {
    tracing::info_span!("stage", stage = %stage, priority)
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}
