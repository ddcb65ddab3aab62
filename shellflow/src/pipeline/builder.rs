//! Dependency graph expansion.
//!
//! Expansion is a memoised depth-first walk over [`Stage::dependencies`].
//! A stage whose outputs are already complete is pruned together with its
//! whole upstream subgraph; everything else becomes a [`PlanNode`].

use crate::core::Target;
use crate::errors::{CycleDetectedError, ShellflowError};
use crate::naming::StageId;
use crate::stages::{Stage, StageInputs, StageRef};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use tracing::debug;

/// A stage scheduled to run.
#[derive(Debug, Clone)]
pub struct PlanNode {
    /// The stage.
    pub stage: StageRef,
    /// Its id.
    pub id: StageId,
    /// Dispatch priority.
    pub priority: i32,
    /// Pre-order position in the expansion, used to break priority ties.
    pub discovery: usize,
    /// Indices of the scheduled dependencies.
    pub deps: Vec<usize>,
    /// Outputs of every declared dependency, scheduled or pruned.
    pub inputs: StageInputs,
    /// Declared outputs.
    pub outputs: Vec<Target>,
}

/// Where a visited stage ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Scheduled at this node index.
    Scheduled(usize),
    /// Already complete.
    Pruned,
}

/// Expands terminal stages into the closure of incomplete ancestors.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<PlanNode>,
    index: HashMap<StageId, usize>,
    pruned: Vec<StageId>,
    pruned_set: HashSet<StageId>,
    resolved: HashMap<StageId, (StageInputs, Vec<Target>)>,
    discovered: usize,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Expands `stages` into the graph.
    ///
    /// Can be called repeatedly; stages already known are not visited again.
    /// Fails with a cycle error before anything is scheduled from the cycle.
    pub fn expand(&mut self, stages: &[StageRef]) -> Result<Vec<Slot>, ShellflowError> {
        stages.iter().map(|stage| self.visit(stage)).collect()
    }

    /// Returns the scheduled nodes; dependencies precede their dependents.
    #[must_use]
    pub fn nodes(&self) -> &[PlanNode] {
        &self.nodes
    }

    /// Returns the ids of pruned stages in the order they were found.
    #[must_use]
    pub fn pruned(&self) -> &[StageId] {
        &self.pruned
    }

    /// Returns the node index of a scheduled stage.
    #[must_use]
    pub fn index_of(&self, id: &StageId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns the resolved outputs of any visited stage.
    #[must_use]
    pub fn outputs_of(&self, id: &StageId) -> Option<&[Target]> {
        self.resolved.get(id).map(|(_, outputs)| outputs.as_slice())
    }

    fn visit(&mut self, stage: &StageRef) -> Result<Slot, ShellflowError> {
        let id = stage.id();
        if let Some(&i) = self.index.get(&id) {
            return Ok(Slot::Scheduled(i));
        }
        if self.pruned_set.contains(&id) {
            return Ok(Slot::Pruned);
        }

        let (inputs, outputs) = self.resolve(stage)?;
        if stage.complete(&outputs) {
            debug!(stage = %id, "pruned: outputs present");
            self.pruned_set.insert(id.clone());
            self.pruned.push(id);
            return Ok(Slot::Pruned);
        }

        let discovery = self.discovered;
        self.discovered += 1;

        let mut deps = Vec::new();
        for dep in stage.dependencies() {
            if let Slot::Scheduled(i) = self.visit(&dep)? {
                if !deps.contains(&i) {
                    deps.push(i);
                }
            }
        }

        let idx = self.nodes.len();
        self.nodes.push(PlanNode {
            stage: stage.clone(),
            id: id.clone(),
            priority: stage.priority(),
            discovery,
            deps,
            inputs,
            outputs,
        });
        self.index.insert(id, idx);
        Ok(Slot::Scheduled(idx))
    }

    /// Resolves the inputs and outputs of a stage, walking its dependencies.
    fn resolve(&mut self, stage: &StageRef) -> Result<(StageInputs, Vec<Target>), ShellflowError> {
        let mut stack = Vec::new();
        self.resolve_inner(stage.as_ref(), &mut stack)
    }

    fn resolve_inner(
        &mut self,
        stage: &dyn Stage,
        stack: &mut Vec<StageId>,
    ) -> Result<(StageInputs, Vec<Target>), ShellflowError> {
        let id = stage.id();
        if let Some(resolved) = self.resolved.get(&id) {
            return Ok(resolved.clone());
        }
        if let Some(start) = stack.iter().position(|s| *s == id) {
            let mut cycle: Vec<String> = stack[start..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return Err(CycleDetectedError::new(cycle).into());
        }

        stack.push(id.clone());
        let mut inputs = StageInputs::default();
        for dep in stage.dependencies() {
            let (_, dep_outputs) = self.resolve_inner(dep.as_ref(), stack)?;
            inputs.push(dep.id(), dep_outputs);
        }
        stack.pop();

        let outputs = stage.outputs(&inputs);
        self.resolved.insert(id, (inputs.clone(), outputs.clone()));
        Ok((inputs, outputs))
    }
}

/// The expanded graph for a set of terminal stages.
#[derive(Debug)]
pub struct ExecutionPlan {
    builder: GraphBuilder,
    terminals: Vec<StageRef>,
}

impl ExecutionPlan {
    /// Expands the terminals.
    pub fn build(terminals: &[StageRef]) -> Result<Self, ShellflowError> {
        let mut builder = GraphBuilder::new();
        builder.expand(terminals)?;
        Ok(Self {
            builder,
            terminals: terminals.to_vec(),
        })
    }

    /// Returns the scheduled nodes.
    #[must_use]
    pub fn nodes(&self) -> &[PlanNode] {
        self.builder.nodes()
    }

    /// Returns the number of scheduled stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.builder.nodes().len()
    }

    /// Returns true if nothing needs to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.builder.nodes().is_empty()
    }

    /// Returns the pruned stage ids.
    #[must_use]
    pub fn pruned(&self) -> &[StageId] {
        self.builder.pruned()
    }

    /// Returns scheduled stage ids, dependencies first.
    #[must_use]
    pub fn execution_order(&self) -> Vec<&StageId> {
        self.builder.nodes().iter().map(|n| &n.id).collect()
    }

    /// Returns the builder, for expanding dynamically planned stages.
    pub fn builder_mut(&mut self) -> &mut GraphBuilder {
        &mut self.builder
    }

    /// Returns the builder.
    #[must_use]
    pub fn builder(&self) -> &GraphBuilder {
        &self.builder
    }

    /// Renders the dependency tree, marking each stage `[PENDING]` or
    /// `[COMPLETE]`. Complete stages are not descended into.
    #[must_use]
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        for terminal in &self.terminals {
            self.render_node(terminal, 0, &mut out);
        }
        out
    }

    fn render_node(&self, stage: &StageRef, depth: usize, out: &mut String) {
        let id = stage.id();
        let pending = self.builder.index_of(&id).is_some();
        let marker = if pending { "[PENDING]" } else { "[COMPLETE]" };
        let _ = writeln!(out, "{}{marker} {id}", "  ".repeat(depth));
        if pending {
            for dep in stage.dependencies() {
                self.render_node(&dep, depth + 1, out);
            }
        }
    }
}
