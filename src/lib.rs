// src/lib.rs

//! Dependency-graph-driven step scheduler with tiered capability escalation.
//!
//! A [`Workflow`] of [`Step`]s is compiled into a
//! [`DependencyGraph`](dag::DependencyGraph), split into execution levels,
//! and run level by level by the [`LevelExecutor`]. A step's work may itself
//! be a [`CascadeExecutor`] that escalates through capability tiers
//! (`code -> generative -> agentic -> human`) resolved via a
//! [`TierRegistry`].

pub mod cli;
pub mod config;
pub mod dag;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod tier;
pub mod types;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::load_and_validate;
use crate::config::{Assembled, ConfigFile, assemble, build_registry};

pub use crate::errors::{CascadeError, RunError, StepError, StructuralError, TierflowError};
pub use crate::exec::{
    DurableStepRunner, ExecutionOptions, ExecutionResult, InMemoryStepRunner, LevelExecutor,
    RetryConfig, StepContext, StepStatus,
};
pub use crate::tier::{
    CapabilityTier, CascadeExecutor, CascadeResult, Priority, TierConfig, TierContext,
    TierRegistry, TierResult,
};
pub use crate::types::{DependencyKind, StepId};
pub use crate::workflow::{Step, StepConfig, Trigger, Workflow};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and CLI overrides
/// - `--route` / `--dry-run` inspection
/// - the level executor over an in-memory durable runner
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)?;

    if args.continue_on_error {
        cfg.options.continue_on_error = true;
    }
    if let Some(n) = args.max_concurrency {
        cfg.options.max_concurrency = Some(usize::try_from(n)?);
    }

    if let Some(failure) = args.route.as_deref() {
        print_route(&cfg, failure);
        return Ok(());
    }

    let Assembled {
        workflow,
        registry,
        options,
    } = assemble(&cfg, Arc::new(tier::TracingSink))?;

    if args.dry_run {
        print_dry_run(&workflow, &registry, &options)?;
        return Ok(());
    }

    let runner: Arc<dyn DurableStepRunner> = Arc::new(InMemoryStepRunner::new());
    let executor = LevelExecutor::new(runner, options);

    let outcome = tokio::select! {
        res = executor.run(&workflow, serde_json::Value::Null) => res,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| anyhow!("failed to listen for Ctrl+C: {e}"))?;
            // Dropping the run future kills running step processes.
            warn!("interrupted; cancelling workflow run");
            bail!("workflow run interrupted");
        }
    };

    match outcome {
        Ok(result) => {
            print_summary(&workflow, &result);
            if !result.failed_steps.is_empty() {
                bail!(
                    "{} step(s) failed, {} skipped",
                    result.failed_steps.len(),
                    result.skipped_steps.len()
                );
            }
            Ok(())
        }
        Err(RunError::Aborted { step, source, partial }) => {
            print_summary(&workflow, &partial);
            Err(anyhow!(source).context(format!("workflow aborted at step '{step}'")))
        }
        Err(RunError::TimedOut { limit, elapsed, partial }) => {
            print_summary(&workflow, &partial);
            bail!("workflow run exceeded its {limit:?} limit after {elapsed:?}")
        }
        Err(err @ RunError::Structural(_)) => Err(err.into()),
    }
}

/// `--route FAILURE`: where a failure goes and what comes after it.
fn print_route(cfg: &ConfigFile, failure: &str) {
    let registry = build_registry(cfg);
    match registry.route_to_tier(failure) {
        Some(tier) => {
            println!("{failure} -> {tier}");
            let chain = registry.fallback_chain(&tier);
            if chain.is_empty() {
                println!("  fallback: (none)");
            } else {
                let names: Vec<String> = chain.iter().map(|t| t.to_string()).collect();
                println!("  fallback: {}", names.join(" -> "));
            }
            match registry.get_next_available_fallback(&tier) {
                Some(next) => println!("  next available: {next}"),
                None => println!("  next available: (escalation exhausted)"),
            }
        }
        None => println!("{failure} -> (no route)"),
    }
}

/// Dry-run output: levels, steps and tiers.
fn print_dry_run(workflow: &Workflow, registry: &TierRegistry, options: &ExecutionOptions) -> Result<()> {
    println!("tierflow dry-run");
    println!("  config.continue_on_error = {}", options.continue_on_error);
    match options.max_concurrency {
        Some(n) => println!("  config.max_concurrency = {n}"),
        None => println!("  config.max_concurrency = (unbounded)"),
    }
    match options.run_timeout {
        Some(limit) => println!("  config.run_timeout = {limit:?}"),
        None => println!("  config.run_timeout = (none)"),
    }
    println!();

    let levels = workflow.levels()?;
    println!("levels ({}):", levels.len());
    for level in &levels {
        println!("  [{}] {}", level.index, level.nodes.join(", "));
        for id in &level.nodes {
            let deps = workflow.graph().dependencies_of(id);
            if deps.is_empty() {
                continue;
            }
            let rendered: Vec<String> = deps
                .iter()
                .map(|d| match workflow.graph().dependency_kind(id, d) {
                    Some(DependencyKind::Soft) => format!("{d} (soft)"),
                    _ => d.clone(),
                })
                .collect();
            println!("      {id} after: {}", rendered.join(", "));
        }
    }
    println!();

    println!("tiers:");
    for tier in registry.tiers_by_priority() {
        let Some(config) = registry.tier_config(&tier) else {
            continue;
        };
        let chain: Vec<String> = registry
            .fallback_chain(&tier)
            .iter()
            .map(|t| t.to_string())
            .collect();
        println!(
            "  - {tier} (priority {}, {})",
            config.priority,
            if config.available { "available" } else { "unavailable" }
        );
        if !chain.is_empty() {
            println!("      fallback: {}", chain.join(" -> "));
        }
    }

    let escalation: Vec<String> = registry
        .escalation_order()
        .iter()
        .map(|t| t.to_string())
        .collect();
    println!("  escalation: {}", escalation.join(" -> "));

    if !workflow.triggers().is_empty() {
        println!();
        println!("triggers:");
        for trigger in workflow.triggers() {
            match trigger {
                Trigger::Event { name } => println!("  - event: {name}"),
                Trigger::Schedule { cron } => println!("  - cron: {cron}"),
            }
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}

fn print_summary(workflow: &Workflow, result: &ExecutionResult) {
    println!("tierflow run");
    for step in workflow.steps() {
        let id = step.id();
        let status = match result.status_of(id) {
            StepStatus::Succeeded => "ok",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::NotAttempted => "not attempted",
        };
        match result.step_durations.get(id) {
            Some(d) => println!("  {id}: {status} ({d:?})"),
            None => println!("  {id}: {status}"),
        }
        if let Some(err) = result.failed_steps.get(id) {
            println!("      {err}");
        }
    }
    info!(
        total = ?result.total_duration,
        parallel_efficiency = result.parallel_efficiency,
        "run summary"
    );
}
