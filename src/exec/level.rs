// src/exec/level.rs

//! Level Executor.
//!
//! Runs a [`Workflow`] one execution level at a time. Within a level every
//! runnable step is spawned concurrently; the next level starts only after
//! all of them resolved. Steps whose hard dependencies did not succeed are
//! skipped, which propagates transitively because their own dependents then
//! fail the same check. Soft dependencies never block.
//!
//! With `continue_on_error = false` the first step failure abandons the run.
//! Sibling steps already in flight are detached, not cancelled: they run to
//! completion in the background and their results are discarded.
//!
//! `run_timeout` bounds the whole run. When it fires, in-flight steps are
//! cancelled and recorded as failed with [`StepError::Cancelled`]; steps of
//! later levels stay [`StepStatus::NotAttempted`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinSet};
use tokio::time::Instant as Deadline;
use tracing::{debug, error, info, warn};

use crate::dag::ExecutionLevel;
use crate::errors::{RunError, StepError};
use crate::exec::durable::DurableStepRunner;
use crate::exec::retry::RetryConfig;
use crate::exec::sleep_until_opt;
use crate::exec::step::DurableStep;
use crate::types::StepId;
use crate::workflow::{Step, Workflow};

/// Knobs for a level-executor run.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Record failures and keep going instead of aborting the run.
    pub continue_on_error: bool,
    /// Upper bound on concurrently running steps within one level.
    pub max_concurrency: Option<usize>,
    /// Timeout for steps that do not set their own.
    pub default_timeout: Option<Duration>,
    /// Retry policy for steps that do not set their own.
    pub default_retry: RetryConfig,
    /// Limit on the whole run, across all levels.
    pub run_timeout: Option<Duration>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            max_concurrency: None,
            default_timeout: None,
            default_retry: RetryConfig::default(),
            run_timeout: None,
        }
    }
}

/// Final state of one step in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Succeeded,
    Failed,
    /// Blocked by a hard dependency that did not succeed.
    Skipped,
    /// Never reached because the run aborted or timed out first.
    NotAttempted,
}

/// Everything a run produced, including on partial failure.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Values of steps that succeeded.
    pub results: BTreeMap<StepId, Value>,
    pub failed_steps: BTreeMap<StepId, StepError>,
    /// Steps skipped because a hard dependency failed or was skipped.
    pub skipped_steps: Vec<StepId>,
    /// Wall-clock duration of every attempted step.
    pub step_durations: BTreeMap<StepId, Duration>,
    pub levels: Vec<ExecutionLevel>,
    /// Wall-clock duration per executed level, in level order.
    pub level_durations: Vec<Duration>,
    pub total_duration: Duration,
    /// `sum(step_durations) / total_duration`; above 1.0 means steps
    /// overlapped.
    pub parallel_efficiency: f64,
}

impl ExecutionResult {
    pub fn status_of(&self, step: &str) -> StepStatus {
        if self.results.contains_key(step) {
            StepStatus::Succeeded
        } else if self.failed_steps.contains_key(step) {
            StepStatus::Failed
        } else if self.skipped_steps.iter().any(|s| s == step) {
            StepStatus::Skipped
        } else {
            StepStatus::NotAttempted
        }
    }

    /// True when every step succeeded.
    pub fn is_success(&self) -> bool {
        self.failed_steps.is_empty() && self.skipped_steps.is_empty()
    }

    fn finish(&mut self, started: Instant) {
        self.total_duration = started.elapsed();
        let busy: Duration = self.step_durations.values().sum();
        self.parallel_efficiency = if self.total_duration.is_zero() {
            0.0
        } else {
            busy.as_secs_f64() / self.total_duration.as_secs_f64()
        };
    }
}

/// Outcome of one spawned step.
type StepOutcome = (StepId, Duration, Result<Value, StepError>);

/// Runs workflows level by level through a [`DurableStep`] wrapper.
#[derive(Debug, Clone)]
pub struct LevelExecutor {
    step_runner: DurableStep,
    options: ExecutionOptions,
}

impl LevelExecutor {
    pub fn new(runner: Arc<dyn DurableStepRunner>, options: ExecutionOptions) -> Self {
        let step_runner = DurableStep::new(runner)
            .with_default_retry(options.default_retry.clone())
            .with_default_timeout(options.default_timeout);
        Self {
            step_runner,
            options,
        }
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// Build a workflow from `steps` and run it.
    pub async fn run_steps(
        &self,
        steps: impl IntoIterator<Item = Step>,
        input: Value,
    ) -> Result<ExecutionResult, RunError> {
        let workflow = Workflow::from_steps(steps)?;
        self.run(&workflow, input).await
    }

    /// Run every level of `workflow` with `input` as the run input.
    pub async fn run(&self, workflow: &Workflow, input: Value) -> Result<ExecutionResult, RunError> {
        workflow.graph().check()?;
        let levels = workflow.levels()?;

        let started = Instant::now();
        let deadline = self.options.run_timeout.map(|limit| Deadline::now() + limit);
        let input = Arc::new(input);
        let semaphore = self
            .options
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut outcome = ExecutionResult {
            levels: levels.clone(),
            ..ExecutionResult::default()
        };

        info!(
            workflow = %workflow.name(),
            steps = workflow.graph().len(),
            levels = levels.len(),
            "starting workflow run"
        );

        for level in &levels {
            let level_started = Instant::now();
            if deadline.is_some_and(|d| Deadline::now() >= d) {
                return Err(self.timed_out(outcome, started));
            }

            let (runnable, blocked) = partition_level(workflow, level, &outcome);
            for id in blocked {
                warn!(step = %id, level = level.index, "skipping step: hard dependency did not succeed");
                outcome.skipped_steps.push(id);
            }

            debug!(
                level = level.index,
                runnable = runnable.len(),
                "executing level"
            );

            // Every step in this level sees the same snapshot of earlier results.
            let results = Arc::new(outcome.results.clone());
            let mut join_set: JoinSet<StepOutcome> = JoinSet::new();
            let mut task_ids: HashMap<TaskId, StepId> = HashMap::new();

            for id in runnable {
                let Some(step) = workflow.step(&id).cloned() else {
                    continue;
                };
                let runner = self.step_runner.clone();
                let input = input.clone();
                let results = results.clone();
                let semaphore = semaphore.clone();
                let step_id = id.clone();

                let handle = join_set.spawn(async move {
                    let _permit = match semaphore {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    let step_started = Instant::now();
                    let res = runner.run(&step, input, results).await;
                    (step_id, step_started.elapsed(), res)
                });
                task_ids.insert(handle.id(), id);
            }

            loop {
                let joined = tokio::select! {
                    biased;
                    joined = join_set.join_next_with_id() => joined,
                    _ = sleep_until_opt(deadline) => {
                        join_set.abort_all();
                        for id in task_ids.into_values() {
                            warn!(step = %id, "run timed out; cancelling step");
                            outcome
                                .failed_steps
                                .insert(id.clone(), StepError::Cancelled { step: id });
                        }
                        outcome.level_durations.push(level_started.elapsed());
                        return Err(self.timed_out(outcome, started));
                    }
                };
                let Some(joined) = joined else {
                    break;
                };

                let (id, duration, res) = match joined {
                    Ok((task_id, outcome)) => {
                        task_ids.remove(&task_id);
                        outcome
                    }
                    Err(join_err) => {
                        let id = task_ids.remove(&join_err.id()).unwrap_or_default();
                        let err = StepError::Execution {
                            step: id.clone(),
                            message: format!("step task did not complete: {join_err}"),
                            attempts: 0,
                        };
                        (id, Duration::ZERO, Err(err))
                    }
                };

                outcome.step_durations.insert(id.clone(), duration);

                match res {
                    Ok(value) => {
                        debug!(step = %id, ?duration, "step succeeded");
                        outcome.results.insert(id, value);
                    }
                    Err(err) => {
                        if self.options.continue_on_error {
                            warn!(step = %id, error = %err, "step failed; continuing");
                            outcome.failed_steps.insert(id, err);
                            continue;
                        }

                        error!(step = %id, error = %err, "step failed; aborting run");
                        outcome.failed_steps.insert(id.clone(), err.clone());

                        // In-flight siblings finish in the background.
                        join_set.detach_all();
                        outcome.level_durations.push(level_started.elapsed());
                        outcome.finish(started);

                        return Err(RunError::Aborted {
                            step: id,
                            source: err,
                            partial: Box::new(outcome),
                        });
                    }
                }
            }

            let level_duration = level_started.elapsed();
            debug!(level = level.index, ?level_duration, "level finished");
            outcome.level_durations.push(level_duration);
        }

        outcome.finish(started);

        info!(
            succeeded = outcome.results.len(),
            failed = outcome.failed_steps.len(),
            skipped = outcome.skipped_steps.len(),
            total = ?outcome.total_duration,
            parallel_efficiency = outcome.parallel_efficiency,
            "workflow run finished"
        );

        Ok(outcome)
    }

    fn timed_out(&self, mut outcome: ExecutionResult, started: Instant) -> RunError {
        outcome.finish(started);
        let limit = self.options.run_timeout.unwrap_or_default();
        error!(?limit, elapsed = ?outcome.total_duration, "workflow run timed out");
        RunError::TimedOut {
            limit,
            elapsed: outcome.total_duration,
            partial: Box::new(outcome),
        }
    }
}

/// Split a level into steps that may run and steps blocked by a hard
/// dependency that has no successful result.
fn partition_level(
    workflow: &Workflow,
    level: &ExecutionLevel,
    outcome: &ExecutionResult,
) -> (Vec<StepId>, Vec<StepId>) {
    let mut runnable = Vec::new();
    let mut blocked = Vec::new();

    for id in &level.nodes {
        let satisfied = workflow
            .graph()
            .hard_dependencies_of(id)
            .iter()
            .all(|dep| outcome.results.contains_key(*dep));

        if satisfied {
            runnable.push(id.clone());
        } else {
            blocked.push(id.clone());
        }
    }

    (runnable, blocked)
}
