// src/exec/mod.rs

//! Step execution layer.
//!
//! - [`retry`] holds the retry/backoff policy shared by steps and tiers.
//! - [`durable`] defines the Durable Step Runner interface the scheduler
//!   consumes, plus an in-memory implementation.
//! - [`step`] wraps a single step's work with naming, retries and timeout.
//! - [`level`] runs a workflow level by level.
//! - [`command`] provides shell-command work functions for the CLI.

use std::future::Future;
use std::pin::Pin;

pub mod command;
pub mod durable;
pub mod level;
pub mod retry;
pub mod step;

pub use durable::{DurableConfig, DurableStepRunner, InMemoryStepRunner, RunnerSnapshot};
pub use level::{ExecutionOptions, ExecutionResult, LevelExecutor, StepStatus};
pub use retry::RetryConfig;
pub use step::{DurableStep, StepContext};

/// Boxed, sendable future used at the trait seams of this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
