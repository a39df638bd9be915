// src/exec/step.rs

//! Durable Step Wrapper.
//!
//! [`DurableStep`] runs one workflow step through the injected
//! [`DurableStepRunner`]: the whole retry loop executes inside a single named
//! `do_step` call, so a step that completed before a restart is replayed
//! rather than re-executed. Each attempt gets a fresh [`StepContext`] and is
//! bounded by the step timeout; backoff between attempts follows the step's
//! [`RetryConfig`] and is a named runner sleep (`<step>/backoff-<n>`), so a
//! restart mid-backoff resumes towards the original wake-up time.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::errors::StepError;
use crate::exec::durable::{DurableStepRunner, DurableWork};
use crate::exec::BoxFuture;
use crate::exec::retry::RetryConfig;
use crate::types::StepId;
use crate::workflow::Step;

/// Per-attempt view handed to a step's work function.
#[derive(Debug, Clone)]
pub struct StepContext {
    step_id: StepId,
    attempt: u32,
    input: Arc<Value>,
    results: Arc<BTreeMap<StepId, Value>>,
    runner: Arc<dyn DurableStepRunner>,
}

impl StepContext {
    pub fn new(
        step_id: impl Into<StepId>,
        attempt: u32,
        input: Arc<Value>,
        results: Arc<BTreeMap<StepId, Value>>,
        runner: Arc<dyn DurableStepRunner>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            input,
            results,
            runner,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Current attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Input the whole workflow run was started with.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Results of every step completed before this step's level.
    pub fn results(&self) -> &BTreeMap<StepId, Value> {
        &self.results
    }

    pub fn result_of(&self, step: &str) -> Option<&Value> {
        self.results.get(step)
    }

    /// `{"input": .., "results": {..}}`, handy for handing everything to a
    /// nested executor in one value.
    pub fn to_value(&self) -> Value {
        json!({
            "input": self.input.as_ref(),
            "results": self.results.as_ref(),
        })
    }

    /// Nested durable side effect, recorded as `<step>/<name>`.
    pub async fn do_step<F, Fut>(&self, name: &str, work: F) -> anyhow::Result<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let scoped = self.scoped(name);
        let work: DurableWork =
            Arc::new(move || -> BoxFuture<'static, anyhow::Result<Value>> { Box::pin(work()) });
        self.runner.do_step(&scoped, work).await
    }

    /// Resumable sleep, recorded as `<step>/<name>`.
    pub async fn sleep(&self, name: &str, duration: Duration) {
        let scoped = self.scoped(name);
        self.runner.sleep(&scoped, duration).await;
    }

    /// Resumable sleep until `wake_at`, recorded as `<step>/<name>`.
    pub async fn sleep_until(&self, name: &str, wake_at: DateTime<Utc>) {
        let scoped = self.scoped(name);
        self.runner.sleep_until(&scoped, wake_at).await;
    }

    fn scoped(&self, name: &str) -> String {
        format!("{}/{}", self.step_id, name)
    }
}

/// Wraps a [`Step`] with naming, retry/backoff and timeout.
#[derive(Debug, Clone)]
pub struct DurableStep {
    runner: Arc<dyn DurableStepRunner>,
    default_retry: RetryConfig,
    default_timeout: Option<Duration>,
}

impl DurableStep {
    pub fn new(runner: Arc<dyn DurableStepRunner>) -> Self {
        Self {
            runner,
            default_retry: RetryConfig::default(),
            default_timeout: None,
        }
    }

    /// Policy used for steps without their own retry config.
    pub fn with_default_retry(mut self, retry: RetryConfig) -> Self {
        self.default_retry = retry;
        self
    }

    /// Timeout used for steps without their own timeout.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run `step`, retrying per its policy.
    ///
    /// Fails with [`StepError::Timeout`] when the last attempt hit the
    /// per-attempt timeout, and [`StepError::Execution`] otherwise.
    pub async fn run(
        &self,
        step: &Step,
        input: Arc<Value>,
        results: Arc<BTreeMap<StepId, Value>>,
    ) -> Result<Value, StepError> {
        let retry = step
            .config()
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry.clone());
        let timeout = step.config().timeout.or(self.default_timeout);

        let step_id = step.id().to_string();
        let work_fn = step.work();
        let runner = self.runner.clone();

        let work: DurableWork = Arc::new(move || -> BoxFuture<'static, anyhow::Result<Value>> {
            let step_id = step_id.clone();
            let work_fn = work_fn.clone();
            let retry = retry.clone();
            let input = input.clone();
            let results = results.clone();
            let runner = runner.clone();

            Box::pin(async move {
                let attempts = retry.attempts();
                let mut last_err = StepError::Execution {
                    step: step_id.clone(),
                    message: "no attempts made".to_string(),
                    attempts: 0,
                };

                for attempt in 1..=attempts {
                    let ctx = StepContext::new(
                        step_id.clone(),
                        attempt,
                        input.clone(),
                        results.clone(),
                        runner.clone(),
                    );
                    debug!(step = %step_id, attempt, "step attempt starting");

                    let outcome = match timeout {
                        Some(limit) => match tokio::time::timeout(limit, work_fn(ctx)).await {
                            Ok(res) => res.map_err(|e| StepError::Execution {
                                step: step_id.clone(),
                                message: format!("{e:#}"),
                                attempts: attempt,
                            }),
                            Err(_) => Err(StepError::Timeout {
                                step: step_id.clone(),
                                limit,
                            }),
                        },
                        None => work_fn(ctx).await.map_err(|e| StepError::Execution {
                            step: step_id.clone(),
                            message: format!("{e:#}"),
                            attempts: attempt,
                        }),
                    };

                    match outcome {
                        Ok(value) => {
                            if attempt > 1 {
                                info!(step = %step_id, attempt, "step succeeded after retry");
                            }
                            return Ok(value);
                        }
                        Err(err) => {
                            if attempt < attempts {
                                let delay = retry.delay_for_attempt(attempt);
                                warn!(
                                    step = %step_id,
                                    attempt,
                                    error = %err,
                                    ?delay,
                                    "step attempt failed; backing off"
                                );
                                runner
                                    .sleep(&format!("{step_id}/backoff-{attempt}"), delay)
                                    .await;
                            }
                            last_err = err;
                        }
                    }
                }

                Err(anyhow::Error::new(last_err))
            })
        });

        match self.runner.do_step(step.id(), work).await {
            Ok(value) => Ok(value),
            Err(err) => match err.downcast::<StepError>() {
                Ok(step_err) => Err(step_err),
                Err(other) => Err(StepError::Execution {
                    step: step.id().to_string(),
                    message: format!("{other:#}"),
                    attempts: 0,
                }),
            },
        }
    }
}
