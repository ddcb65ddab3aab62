//! The handle a stage receives while it runs.

use super::cleanup::CleanupRegistry;
use super::run_context::RunContextBuilder;
use crate::config::ShellConfig;
use crate::core::Target;
use crate::events::{EventSink, NoOpEventSink};
use crate::naming::StageId;
use crate::stages::StageInputs;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Execution context for one stage.
///
/// Holds the resolved inputs and declared outputs of the stage, the shared
/// shell configuration, and the explicit event sink. Every run context opened
/// from it shares its cleanup registry and reports its log path back here.
#[derive(Clone)]
pub struct StageContext {
    stage: StageId,
    inputs: StageInputs,
    dynamic_inputs: StageInputs,
    outputs: Vec<Target>,
    config: Arc<ShellConfig>,
    fan_out_limit: Option<usize>,
    events: Arc<dyn EventSink>,
    cleanup: Arc<CleanupRegistry>,
    log_paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("stage", &self.stage)
            .field("inputs", &self.inputs.len())
            .field("dynamic_inputs", &self.dynamic_inputs.len())
            .field("outputs", &self.outputs)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

impl StageContext {
    /// Creates a context with no inputs or outputs and a no-op event sink.
    #[must_use]
    pub fn new(stage: StageId, config: Arc<ShellConfig>) -> Self {
        let cleanup = Arc::new(CleanupRegistry::new(config.remove_if_failed));
        Self {
            stage,
            inputs: StageInputs::default(),
            dynamic_inputs: StageInputs::default(),
            outputs: Vec::new(),
            config,
            fan_out_limit: None,
            events: Arc::new(NoOpEventSink),
            cleanup,
            log_paths: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sets the outputs of the declared dependencies.
    #[must_use]
    pub fn with_inputs(mut self, inputs: StageInputs) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the outputs of stages returned by `plan`.
    #[must_use]
    pub fn with_dynamic_inputs(mut self, inputs: StageInputs) -> Self {
        self.dynamic_inputs = inputs;
        self
    }

    /// Sets the declared outputs and registers their paths for cleanup.
    #[must_use]
    pub fn with_outputs(mut self, outputs: Vec<Target>) -> Self {
        for target in &outputs {
            self.cleanup.register_all(target.paths());
        }
        self.outputs = outputs;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Bounds fan-out concurrency for every run context of this stage.
    #[must_use]
    pub fn with_fan_out_limit(mut self, limit: Option<usize>) -> Self {
        self.fan_out_limit = limit;
        self
    }

    /// Returns the stage id.
    #[must_use]
    pub fn stage_id(&self) -> &StageId {
        &self.stage
    }

    /// Returns the outputs of the declared dependencies.
    #[must_use]
    pub fn inputs(&self) -> &StageInputs {
        &self.inputs
    }

    /// Returns the outputs of the dynamically planned stages.
    #[must_use]
    pub fn dynamic_inputs(&self) -> &StageInputs {
        &self.dynamic_inputs
    }

    /// Returns the declared outputs.
    #[must_use]
    pub fn outputs(&self) -> &[Target] {
        &self.outputs
    }

    /// Returns the shell configuration.
    #[must_use]
    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Returns the fan-out bound.
    #[must_use]
    pub fn fan_out_limit(&self) -> Option<usize> {
        self.fan_out_limit
    }

    /// Returns the event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Returns the cleanup registry.
    #[must_use]
    pub fn cleanup(&self) -> &Arc<CleanupRegistry> {
        &self.cleanup
    }

    /// Returns the log files opened by this stage so far.
    #[must_use]
    pub fn log_paths(&self) -> Vec<PathBuf> {
        self.log_paths.lock().clone()
    }

    pub(crate) fn record_log_path(&self, path: PathBuf) {
        let mut paths = self.log_paths.lock();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Logs a progress message and echoes it unless quiet.
    pub fn print_log(&self, message: &str) {
        info!(stage = %self.stage, "{message}");
        if !self.config.quiet {
            println!(">>\t{message}");
        }
    }

    /// Starts building a run context keyed by `run_id`.
    #[must_use]
    pub fn setup_shell(&self, run_id: impl Into<String>) -> RunContextBuilder<'_> {
        RunContextBuilder::new(self, run_id.into())
    }

    /// Tears the stage down. On failure, removes registered outputs unless
    /// cleanup is disabled, and returns the removed paths.
    pub async fn finish(&self, failed: bool) -> Vec<PathBuf> {
        if failed {
            self.cleanup.run_all().await
        } else {
            self.cleanup.clear();
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_finish_removes_declared_outputs_on_failure() {
        let dir = TempDir::new().unwrap();
        let vcf = dir.path().join("out.vcf.gz");
        fs::write(&vcf, "partial").unwrap();

        let ctx = StageContext::new(StageId::new("merge"), Arc::new(ShellConfig::new()))
            .with_outputs(vec![Target::indexed(&vcf, ".tbi")]);
        assert_eq!(ctx.cleanup().pending_count(), 2);

        let removed = ctx.finish(true).await;
        assert_eq!(removed, vec![vcf.clone()]);
        assert!(!vcf.exists());
    }

    #[tokio::test]
    async fn test_finish_keeps_outputs_when_cleanup_disabled() {
        let dir = TempDir::new().unwrap();
        let vcf = dir.path().join("out.vcf.gz");
        fs::write(&vcf, "partial").unwrap();

        let config = Arc::new(ShellConfig::new().with_remove_if_failed(false));
        let ctx = StageContext::new(StageId::new("merge"), config)
            .with_outputs(vec![Target::new(&vcf)]);

        assert!(ctx.finish(true).await.is_empty());
        assert!(vcf.exists());
    }

    #[tokio::test]
    async fn test_finish_on_success_keeps_outputs() {
        let dir = TempDir::new().unwrap();
        let vcf = dir.path().join("out.vcf.gz");
        fs::write(&vcf, "done").unwrap();

        let ctx = StageContext::new(StageId::new("merge"), Arc::new(ShellConfig::new()))
            .with_outputs(vec![Target::new(&vcf)]);
        assert!(ctx.finish(false).await.is_empty());
        assert!(vcf.exists());
        assert_eq!(ctx.cleanup().pending_count(), 0);
    }

    #[test]
    fn test_print_log_in_both_modes() {
        for quiet in [true, false] {
            let config = Arc::new(ShellConfig::new().with_quiet(quiet));
            let ctx = StageContext::new(StageId::new("call"), config);
            ctx.print_log("Call somatic variants");
            assert!(ctx.log_paths().is_empty());
        }
    }

    #[test]
    fn test_record_log_path_dedups() {
        let ctx = StageContext::new(StageId::new("s"), Arc::new(ShellConfig::new()));
        ctx.record_log_path(PathBuf::from("/l/a.sh.log"));
        ctx.record_log_path(PathBuf::from("/l/a.sh.log"));
        assert_eq!(ctx.log_paths(), vec![PathBuf::from("/l/a.sh.log")]);
    }
}
