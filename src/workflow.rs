// src/workflow.rs

//! Workflow definitions.
//!
//! A [`Workflow`] is an ordered list of [`Step`]s compiled into a
//! [`DependencyGraph`] at [`WorkflowBuilder::build`] time, plus optional
//! trigger declarations. Dispatching triggers is left to the embedding
//! application; the workflow only records them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::dag::{DependencyGraph, ExecutionLevel, execution_levels};
use crate::errors::StructuralError;
use crate::exec::BoxFuture;
use crate::exec::retry::RetryConfig;
use crate::exec::step::StepContext;
use crate::types::{DependencyKind, StepId};

/// Work function of a step.
pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Optional per-step execution settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepConfig {
    pub retry: Option<RetryConfig>,
    /// Per-attempt time limit.
    pub timeout: Option<Duration>,
}

/// One node of a workflow: identity, dependencies and work.
#[derive(Clone)]
pub struct Step {
    id: StepId,
    dependencies: Vec<(StepId, DependencyKind)>,
    config: StepConfig,
    work: StepFn,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Step {
    /// Step with default configuration.
    pub fn new<F, Fut>(id: impl Into<StepId>, work: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::with_config(id, StepConfig::default(), work)
    }

    /// Step with explicit retry/timeout configuration.
    pub fn with_config<F, Fut>(id: impl Into<StepId>, config: StepConfig, work: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let work: StepFn =
            Arc::new(move |ctx: StepContext| -> BoxFuture<'static, anyhow::Result<Value>> { Box::pin(work(ctx)) });
        Self::from_fn(id, config, work)
    }

    /// Step around an already boxed work function.
    pub fn from_fn(id: impl Into<StepId>, config: StepConfig, work: StepFn) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            config,
            work,
        }
    }

    /// Add a hard dependency.
    pub fn after(self, dep: impl Into<StepId>) -> Self {
        self.depends_on(dep, DependencyKind::Hard)
    }

    /// Add a soft dependency.
    pub fn after_soft(self, dep: impl Into<StepId>) -> Self {
        self.depends_on(dep, DependencyKind::Soft)
    }

    pub fn depends_on(mut self, dep: impl Into<StepId>, kind: DependencyKind) -> Self {
        self.dependencies.push((dep.into(), kind));
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = Some(retry);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dependencies(&self) -> &[(StepId, DependencyKind)] {
        &self.dependencies
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn work(&self) -> StepFn {
        self.work.clone()
    }
}

/// Declared trigger for a workflow. Only recorded, never dispatched here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Run when a named event is emitted.
    Event { name: String },
    /// Run on a cron-style schedule.
    Schedule { cron: String },
}

/// Validated, immutable workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    graph: DependencyGraph,
    steps: HashMap<StepId, Step>,
    triggers: Vec<Trigger>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Build an unnamed workflow straight from a list of steps.
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Result<Self, StructuralError> {
        steps
            .into_iter()
            .fold(WorkflowBuilder::new("workflow"), WorkflowBuilder::step)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Steps in definition order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.graph.nodes().filter_map(|id| self.steps.get(id))
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    pub fn levels(&self) -> Result<Vec<ExecutionLevel>, StructuralError> {
        execution_levels(&self.graph)
    }
}

/// Collects steps and triggers, then validates them into a [`Workflow`].
#[derive(Debug)]
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<Step>,
    triggers: Vec<Trigger>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            triggers: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Compile into a graph and reject duplicates, unknown dependencies and
    /// cycles (including self-dependencies).
    pub fn build(self) -> Result<Workflow, StructuralError> {
        let mut graph = DependencyGraph::new();
        let mut steps = HashMap::with_capacity(self.steps.len());

        for step in self.steps {
            graph.add_node_with_edges(step.id.clone(), step.dependencies.clone())?;
            steps.insert(step.id.clone(), step);
        }

        graph.check()?;

        debug!(
            workflow = %self.name,
            steps = graph.len(),
            triggers = self.triggers.len(),
            "workflow built"
        );

        Ok(Workflow {
            name: self.name,
            graph,
            steps,
            triggers: self.triggers,
        })
    }
}
