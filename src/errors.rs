// src/errors.rs

//! Crate-wide error types.
//!
//! The taxonomy mirrors the way failures flow through a run:
//! - [`StructuralError`] is raised while building/validating a graph and is
//!   never retried.
//! - [`StepError`] is what a single durable step produces once its retries
//!   are exhausted (or its timeout fires).
//! - [`CascadeError`] is terminal for one cascade invocation.
//! - [`RunError`] is returned by the level executor when a run aborts or
//!   exceeds its time limit.
//!
//! [`TierflowError`] wraps all of them for the binary and config loading.

use std::time::Duration;

use thiserror::Error;

use crate::exec::level::ExecutionResult;
use crate::tier::types::TierResult;

/// Problems with the shape of a dependency graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralError {
    #[error("duplicate node '{0}'")]
    DuplicateNode(String),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    MissingDependency { node: String, dependency: String },

    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency {
        /// Cycle path, starting and ending with the same node.
        path: Vec<String>,
    },

    #[error("cycle detected; unresolved nodes: {}", unresolved.join(", "))]
    CycleDetected { unresolved: Vec<String> },
}

impl StructuralError {
    /// Nodes involved in the error, for diagnostics.
    pub fn nodes(&self) -> Vec<String> {
        match self {
            StructuralError::DuplicateNode(id) => vec![id.clone()],
            StructuralError::MissingDependency { node, dependency } => {
                vec![node.clone(), dependency.clone()]
            }
            StructuralError::CircularDependency { path } => path.clone(),
            StructuralError::CycleDetected { unresolved } => unresolved.clone(),
        }
    }
}

/// Failure of a single step after its local retry policy has been applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("step '{step}' failed after {attempts} attempt(s): {message}")]
    Execution {
        step: String,
        message: String,
        attempts: u32,
    },

    #[error("step '{step}' timed out after {limit:?}")]
    Timeout { step: String, limit: Duration },

    #[error("step '{step}' was cancelled")]
    Cancelled { step: String },
}

impl StepError {
    pub fn step(&self) -> &str {
        match self {
            StepError::Execution { step, .. }
            | StepError::Timeout { step, .. }
            | StepError::Cancelled { step } => step,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StepError::Timeout { .. })
    }
}

/// Terminal outcomes of a cascade that produced no value.
#[derive(Error, Debug, Clone)]
pub enum CascadeError {
    #[error("all {} attempted tier(s) failed", history.len())]
    AllTiersFailed {
        /// One entry per attempted tier, in execution order.
        history: Vec<TierResult>,
    },

    #[error("cascade timed out after {elapsed:?} (limit {limit:?})")]
    CascadeTimeout {
        limit: Duration,
        elapsed: Duration,
        history: Vec<TierResult>,
    },

    #[error("no tier handlers configured")]
    NoTiersConfigured,
}

impl CascadeError {
    pub fn history(&self) -> &[TierResult] {
        match self {
            CascadeError::AllTiersFailed { history }
            | CascadeError::CascadeTimeout { history, .. } => history,
            CascadeError::NoTiersConfigured => &[],
        }
    }
}

/// A level-executor run that stopped before completing every level.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Structural(#[from] StructuralError),

    #[error("run aborted: {source}")]
    Aborted {
        step: String,
        #[source]
        source: StepError,
        /// Everything known about the run at the moment it was abandoned.
        partial: Box<ExecutionResult>,
    },

    /// The whole-run limit elapsed. In-flight steps were cancelled.
    #[error("run timed out after {elapsed:?} (limit {limit:?})")]
    TimedOut {
        limit: Duration,
        elapsed: Duration,
        partial: Box<ExecutionResult>,
    },
}

#[derive(Error, Debug)]
pub enum TierflowError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid graph: {0}")]
    Structural(#[from] StructuralError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Cascade(#[from] CascadeError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TierflowError>;
