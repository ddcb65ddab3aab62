//! Event sinks for engine observability.
//!
//! The scheduler and every run context receive an explicit
//! `Arc<dyn EventSink>` handle; there is no process-wide sink.
//!
//! Event types emitted by the engine:
//! - `stage.pruned`, `stage.planned`, `stage.started`, `stage.completed`,
//!   `stage.failed`, `stage.withheld`
//! - `command.started`, `command.finished`
//! - `pipeline.completed`

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

#[cfg(test)]
pub use sink::MockEventSink;
