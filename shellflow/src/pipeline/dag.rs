//! Bounded-concurrency execution of an expanded stage graph.
//!
//! The scheduler repeatedly computes the ready set (pending stages whose
//! dependencies are complete), orders it by priority then discovery order,
//! and dispatches as many stages as there are free worker slots. Stages run
//! on tokio tasks; completions are collected through `FuturesUnordered`.

use super::builder::{ExecutionPlan, Slot};
use super::failure::{FailureMode, FailureRecord, FailureReport};
use crate::config::{EngineConfig, ShellConfig};
use crate::context::StageContext;
use crate::core::{CompletionOracle, StageStatus, Target};
use crate::errors::{CommandExecutionError, CycleDetectedError, ShellflowError};
use crate::events::{EventSink, NoOpEventSink};
use crate::naming::StageId;
use crate::observability::{stage_span, SpanTimer};
use crate::stages::{StageInputs, StageRef};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Unique id of this invocation.
    pub invocation_id: Uuid,
    /// Stages that ran successfully, in completion order.
    pub executed: Vec<StageId>,
    /// Stages skipped because their outputs were present.
    pub pruned: Vec<StageId>,
    /// Stages whose run failed.
    pub failed: Vec<StageId>,
    /// Stages never dispatched because an ancestor failed.
    pub withheld: Vec<StageId>,
    /// Stages in the order they were handed to a worker.
    pub dispatch_order: Vec<StageId>,
    /// Wall-clock duration of the run.
    pub duration_ms: f64,
    failures: FailureReport,
}

impl RunReport {
    fn new(invocation_id: Uuid) -> Self {
        Self {
            invocation_id,
            executed: Vec::new(),
            pruned: Vec::new(),
            failed: Vec::new(),
            withheld: Vec::new(),
            dispatch_order: Vec::new(),
            duration_ms: 0.0,
            failures: FailureReport::default(),
        }
    }

    /// Returns true if no stage failed or was withheld.
    #[must_use]
    pub fn success(&self) -> bool {
        self.failed.is_empty() && self.withheld.is_empty()
    }

    /// Returns the aggregated failure report.
    #[must_use]
    pub fn failure_report(&self) -> &FailureReport {
        &self.failures
    }

    /// Returns the process exit status for this run.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.success())
    }

    /// Returns the final status of a stage, if it was part of the run.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<StageStatus> {
        let has = |ids: &[StageId]| ids.iter().any(|s| s.as_str() == id);
        if has(&self.executed) {
            Some(StageStatus::Complete)
        } else if has(&self.pruned) {
            Some(StageStatus::Pruned)
        } else if has(&self.failed) {
            Some(StageStatus::Failed)
        } else if has(&self.withheld) {
            Some(StageStatus::Withheld)
        } else {
            None
        }
    }
}

/// Runs stage graphs with a bounded number of concurrent stages.
pub struct Scheduler {
    config: EngineConfig,
    shell: Arc<ShellConfig>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler after validating the configuration.
    pub fn new(config: EngineConfig) -> Result<Self, ShellflowError> {
        config.validate()?;
        Ok(Self {
            shell: Arc::new(config.shell.clone()),
            config,
            events: Arc::new(NoOpEventSink),
        })
    }

    /// Sets the event sink handed to the scheduler and every stage.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Expands the terminals into an execution plan.
    pub fn plan(&self, terminals: &[StageRef]) -> Result<ExecutionPlan, ShellflowError> {
        let plan = ExecutionPlan::build(terminals)?;
        debug!(tree = %plan.render_tree(), "expanded stage graph");
        Ok(plan)
    }

    /// Expands and runs the terminals.
    ///
    /// Returns `Err` only for errors detected before any stage runs, such as
    /// a cycle. Stage failures are reported in the [`RunReport`].
    pub async fn run(&self, terminals: &[StageRef]) -> Result<RunReport, ShellflowError> {
        let plan = self.plan(terminals)?;
        Ok(self.execute(plan).await)
    }

    /// Runs an already expanded plan.
    pub async fn execute(&self, plan: ExecutionPlan) -> RunReport {
        let timer = SpanTimer::start("pipeline");
        let mut run = Execution::new(self, plan);
        info!(
            invocation = %run.report.invocation_id,
            stages = run.plan.stage_count(),
            pruned = run.plan.pruned().len(),
            max_workers = self.config.max_workers,
            "starting run"
        );
        run.record_new_prunes();

        let mut contexts: HashMap<usize, StageContext> = HashMap::new();
        let mut running = FuturesUnordered::new();

        loop {
            let mut progressed = false;
            if !run.halted {
                progressed |= run.plan_ready();

                let free = self.config.max_workers.saturating_sub(running.len());
                for (i, ctx) in run.dispatch(free, &mut progressed) {
                    let stage = run.plan.nodes()[i].stage.clone();
                    let priority = run.plan.nodes()[i].priority;
                    contexts.insert(i, ctx.clone());
                    let handle = spawn_stage(stage, ctx, priority);
                    running.push(async move { (i, handle.await) });
                }
            }

            if progressed {
                continue;
            }
            let Some((i, joined)) = running.next().await else {
                break;
            };
            let ctx = contexts.remove(&i);
            match joined {
                Ok(outcome) => run.finish_stage(i, outcome),
                Err(e) => {
                    let mut log_paths = Vec::new();
                    if let Some(ctx) = ctx {
                        ctx.finish(true).await;
                        log_paths = ctx.log_paths();
                    }
                    let err = ShellflowError::Internal(format!("stage task panicked: {e}"));
                    run.mark_failed(i, &err, log_paths);
                }
            }
        }

        run.withhold_remaining();
        let mut report = run.report;
        report.duration_ms = timer.elapsed_ms();
        self.events.try_emit(
            "pipeline.completed",
            Some(json!({
                "invocation": report.invocation_id.to_string(),
                "executed": report.executed.len(),
                "pruned": report.pruned.len(),
                "failed": report.failed.len(),
                "withheld": report.withheld.len(),
                "duration_ms": report.duration_ms,
            })),
        );
        if report.success() {
            info!(executed = report.executed.len(), duration_ms = report.duration_ms, "run succeeded");
        } else {
            error!(
                failed = report.failed.len(),
                withheld = report.withheld.len(),
                "run failed\n{}",
                report.failures
            );
        }
        report
    }
}

/// What a stage task returns to the scheduler.
#[derive(Debug)]
struct StageOutcome {
    result: Result<(), ShellflowError>,
    log_paths: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    duration_ms: f64,
}

fn spawn_stage(stage: StageRef, ctx: StageContext, priority: i32) -> JoinHandle<StageOutcome> {
    let span = stage_span(ctx.stage_id().as_str(), priority);
    tokio::spawn(
        async move {
            let timer = SpanTimer::start(ctx.stage_id().as_str());
            let mut result = stage.run(&ctx).await;
            if result.is_ok() {
                let missing = CompletionOracle::missing(ctx.outputs());
                if !missing.is_empty() {
                    result = Err(CommandExecutionError::outputs_missing(
                        ctx.stage_id().as_str(),
                        "stage run",
                        missing,
                    )
                    .into());
                }
            }
            let removed = ctx.finish(result.is_err()).await;
            StageOutcome {
                result,
                log_paths: ctx.log_paths(),
                removed,
                duration_ms: timer.elapsed_ms(),
            }
        }
        .instrument(span),
    )
}

#[derive(Debug, Default)]
struct NodeState {
    status: StageStatus,
    planned: bool,
    extra_deps: Vec<usize>,
    dynamic_inputs: StageInputs,
}

/// Mutable state of one run.
struct Execution<'a> {
    scheduler: &'a Scheduler,
    plan: ExecutionPlan,
    states: Vec<NodeState>,
    report: RunReport,
    pruned_seen: usize,
    halted: bool,
}

impl<'a> Execution<'a> {
    fn new(scheduler: &'a Scheduler, plan: ExecutionPlan) -> Self {
        let mut states = Vec::new();
        states.resize_with(plan.stage_count(), NodeState::default);
        Self {
            scheduler,
            plan,
            states,
            report: RunReport::new(Uuid::now_v7()),
            pruned_seen: 0,
            halted: false,
        }
    }

    fn emit(&self, event_type: &str, data: serde_json::Value) {
        self.scheduler.events.try_emit(event_type, Some(data));
    }

    fn record_new_prunes(&mut self) {
        let fresh: Vec<StageId> = self.plan.pruned()[self.pruned_seen..].to_vec();
        self.pruned_seen = self.plan.pruned().len();
        for id in fresh {
            debug!(stage = %id, "stage already complete");
            self.emit("stage.pruned", json!({"stage": id.as_str()}));
            self.report.pruned.push(id);
        }
    }

    fn deps_satisfied(&self, i: usize) -> bool {
        self.plan.nodes()[i]
            .deps
            .iter()
            .chain(self.states[i].extra_deps.iter())
            .all(|&d| self.states[d].status.is_satisfied())
    }

    fn is_ready(&self, i: usize) -> bool {
        self.states[i].status == StageStatus::Pending && self.deps_satisfied(i)
    }

    /// Calls `plan` on every ready stage not planned yet and folds the
    /// returned stages into the graph. Returns true if anything was planned.
    fn plan_ready(&mut self) -> bool {
        let mut progressed = false;
        let mut i = 0;
        while i < self.plan.stage_count() {
            if self.is_ready(i) && !self.states[i].planned {
                self.states[i].planned = true;
                progressed = true;
                if let Err(e) = self.plan_stage(i) {
                    self.mark_failed(i, &e, Vec::new());
                }
            }
            i += 1;
        }
        progressed
    }

    fn plan_stage(&mut self, i: usize) -> Result<(), ShellflowError> {
        let node = &self.plan.nodes()[i];
        let (id, stage, inputs) = (node.id.clone(), node.stage.clone(), node.inputs.clone());
        let extra = stage.plan(&inputs)?;
        if extra.is_empty() {
            return Ok(());
        }

        let slots = self.plan.builder_mut().expand(&extra)?;
        self.states
            .resize_with(self.plan.stage_count(), NodeState::default);
        self.record_new_prunes();

        let mut dynamic = StageInputs::default();
        let mut extra_deps = Vec::new();
        for (sub, slot) in extra.iter().zip(slots) {
            let sub_id = sub.id();
            let outputs = self
                .plan
                .builder()
                .outputs_of(&sub_id)
                .map(<[Target]>::to_vec)
                .unwrap_or_default();
            dynamic.push(sub_id, outputs);
            match slot {
                Slot::Scheduled(j) if j == i => {
                    return Err(CycleDetectedError::new(vec![id.to_string(), id.to_string()]).into());
                }
                Slot::Scheduled(j) if !extra_deps.contains(&j) => extra_deps.push(j),
                _ => {}
            }
        }

        for &j in &extra_deps {
            if let Some(path) = self.path_between(j, i) {
                let mut cycle = vec![id.to_string()];
                cycle.extend(path.iter().map(|&k| self.plan.nodes()[k].id.to_string()));
                return Err(CycleDetectedError::new(cycle).into());
            }
        }

        debug!(stage = %id, dynamic = extra.len(), scheduled = extra_deps.len(), "planned sub-stages");
        self.emit(
            "stage.planned",
            json!({"stage": id.as_str(), "dynamic": extra.len(), "scheduled": extra_deps.len()}),
        );
        self.states[i].extra_deps = extra_deps;
        self.states[i].dynamic_inputs = dynamic;
        Ok(())
    }

    /// Returns the nodes on a dependency path from `from` down to `to`,
    /// both included, following declared and planned dependencies.
    fn path_between(&self, from: usize, to: usize) -> Option<Vec<usize>> {
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut stack = vec![from];
        let mut seen = vec![false; self.plan.stage_count()];
        seen[from] = true;
        while let Some(k) = stack.pop() {
            if k == to {
                let mut path = vec![k];
                let mut cur = k;
                while let Some(&p) = parent.get(&cur) {
                    path.push(p);
                    cur = p;
                }
                path.reverse();
                return Some(path);
            }
            let deps = self.plan.nodes()[k].deps.iter().chain(self.states[k].extra_deps.iter());
            for &d in deps {
                if !seen[d] {
                    seen[d] = true;
                    parent.insert(d, k);
                    stack.push(d);
                }
            }
        }
        None
    }

    /// Picks up to `free` ready stages by priority, then discovery order.
    /// Stages found complete at this point are pruned instead of run.
    fn dispatch(&mut self, free: usize, progressed: &mut bool) -> Vec<(usize, StageContext)> {
        let nodes = self.plan.nodes();
        let mut ready: Vec<usize> = (0..nodes.len())
            .filter(|&i| self.states[i].planned && self.is_ready(i))
            .collect();
        ready.sort_by_key(|&i| (Reverse(nodes[i].priority), nodes[i].discovery));

        let mut dispatched = Vec::new();
        for i in ready {
            if dispatched.len() >= free {
                break;
            }
            let node = &self.plan.nodes()[i];
            if node.stage.complete(&node.outputs) {
                let id = node.id.clone();
                debug!(stage = %id, "outputs appeared before dispatch");
                self.states[i].status = StageStatus::Pruned;
                self.emit("stage.pruned", json!({"stage": id.as_str()}));
                self.report.pruned.push(id);
                *progressed = true;
                continue;
            }

            let config = &self.scheduler.config;
            let ctx = StageContext::new(node.id.clone(), Arc::clone(&self.scheduler.shell))
                .with_inputs(node.inputs.clone())
                .with_dynamic_inputs(self.states[i].dynamic_inputs.clone())
                .with_outputs(node.outputs.clone())
                .with_events(Arc::clone(&self.scheduler.events))
                .with_fan_out_limit(config.fan_out_limit);

            info!(stage = %node.id, priority = node.priority, "dispatching stage");
            self.emit(
                "stage.started",
                json!({"stage": node.id.as_str(), "priority": node.priority}),
            );
            self.report.dispatch_order.push(node.id.clone());
            self.states[i].status = StageStatus::Running;
            dispatched.push((i, ctx));
        }
        dispatched
    }

    fn finish_stage(&mut self, i: usize, outcome: StageOutcome) {
        match outcome.result {
            Ok(()) => {
                let id = self.plan.nodes()[i].id.clone();
                info!(stage = %id, duration_ms = outcome.duration_ms, "stage completed");
                self.emit(
                    "stage.completed",
                    json!({"stage": id.as_str(), "duration_ms": outcome.duration_ms}),
                );
                self.states[i].status = StageStatus::Complete;
                self.report.executed.push(id);
            }
            Err(e) => {
                if !outcome.removed.is_empty() {
                    warn!(
                        stage = %self.plan.nodes()[i].id,
                        removed = ?outcome.removed,
                        "removed outputs of failed stage"
                    );
                }
                self.mark_failed(i, &e, outcome.log_paths);
            }
        }
    }

    fn mark_failed(&mut self, i: usize, err: &ShellflowError, log_paths: Vec<PathBuf>) {
        let id = self.plan.nodes()[i].id.clone();
        error!(stage = %id, kind = err.kind(), error = %err, "stage failed");
        self.emit(
            "stage.failed",
            json!({
                "stage": id.as_str(),
                "error": err.to_string(),
                "error_kind": err.kind(),
                "log_paths": log_paths,
            }),
        );
        self.states[i].status = StageStatus::Failed;
        self.report
            .failures
            .failures
            .push(FailureRecord::new(id.as_str(), err).with_log_paths(log_paths));
        self.report.failed.push(id);

        match self.scheduler.config.failure_mode {
            FailureMode::ContinueOnFailure => self.withhold_dependents(i),
            FailureMode::FailFast => self.halted = true,
        }
    }

    /// Withholds every pending stage that transitively depends on `failed`.
    fn withhold_dependents(&mut self, failed: usize) {
        loop {
            let blocked: Vec<usize> = (0..self.plan.stage_count())
                .filter(|&j| self.states[j].status == StageStatus::Pending && self.is_blocked(j))
                .collect();
            if blocked.is_empty() {
                break;
            }
            for j in blocked {
                self.withhold(j, Some(failed));
            }
        }
    }

    fn is_blocked(&self, j: usize) -> bool {
        self.plan.nodes()[j]
            .deps
            .iter()
            .chain(self.states[j].extra_deps.iter())
            .any(|&d| self.states[d].status.blocks_dependents())
    }

    fn withhold_remaining(&mut self) {
        for j in 0..self.plan.stage_count() {
            if !self.states[j].status.is_terminal() {
                self.withhold(j, None);
            }
        }
    }

    fn withhold(&mut self, j: usize, ancestor: Option<usize>) {
        let id = self.plan.nodes()[j].id.clone();
        let ancestor = ancestor.map(|a| self.plan.nodes()[a].id.to_string());
        warn!(stage = %id, failed_ancestor = ?ancestor, "stage withheld");
        self.emit(
            "stage.withheld",
            json!({"stage": id.as_str(), "failed_ancestor": ancestor}),
        );
        self.states[j].status = StageStatus::Withheld;
        self.report.failures.withheld.push(id.to_string());
        self.report.withheld.push(id);
    }
}
