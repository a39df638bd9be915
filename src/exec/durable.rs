// src/exec/durable.rs

//! Durable Step Runner interface.
//!
//! The scheduler never persists anything itself. It hands every unit of work
//! to a [`DurableStepRunner`], which must guarantee that calling
//! [`do_step`](DurableStepRunner::do_step) twice with the same name within one
//! logical run replays the recorded result instead of running the work again.
//! Named sleeps must likewise survive a restart: a sleep that already began
//! resumes towards its original wake-up time.
//!
//! [`InMemoryStepRunner`] implements the contract in memory. It is what the
//! CLI and the tests use; its [`RunnerSnapshot`] can be serialized and fed
//! back in to simulate a process restart.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::BoxFuture;

/// Work handed to the runner. It may be invoked more than once when the
/// runner itself retries.
pub type DurableWork = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Runner-level execution settings for one named side effect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurableConfig {
    /// Extra attempts the runner itself may make.
    pub retries: u32,
    /// Per-attempt time limit enforced by the runner.
    pub timeout: Option<Duration>,
}

/// Named, idempotent side-effect executor.
pub trait DurableStepRunner: Send + Sync + Debug {
    /// Execute `work` under `name`, or replay its recorded result.
    fn do_step<'a>(&'a self, name: &'a str, work: DurableWork) -> BoxFuture<'a, Result<Value>> {
        self.do_step_with_config(name, DurableConfig::default(), work)
    }

    /// Like [`do_step`](Self::do_step) with runner-level retries/timeout.
    fn do_step_with_config<'a>(
        &'a self,
        name: &'a str,
        config: DurableConfig,
        work: DurableWork,
    ) -> BoxFuture<'a, Result<Value>>;

    /// Resumable sleep for `duration`, keyed by `name`.
    fn sleep<'a>(&'a self, name: &'a str, duration: Duration) -> BoxFuture<'a, ()>;

    /// Resumable sleep until a wall-clock instant, keyed by `name`.
    fn sleep_until<'a>(&'a self, name: &'a str, wake_at: DateTime<Utc>) -> BoxFuture<'a, ()>;
}

/// Serializable state of an [`InMemoryStepRunner`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerSnapshot {
    /// Recorded results of completed named steps.
    pub completed: BTreeMap<String, Value>,
    /// Wake-up times of sleeps that have started (finished or not).
    pub sleeps: BTreeMap<String, DateTime<Utc>>,
}

/// In-memory [`DurableStepRunner`].
///
/// Only successful results are recorded; a failed step runs again when
/// replayed. Concurrent calls with the same name are serialized, so the
/// later ones replay the first one's result.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStepRunner {
    state: Arc<Mutex<RunnerSnapshot>>,
    in_flight: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl InMemoryStepRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from previously captured state.
    pub fn from_snapshot(snapshot: RunnerSnapshot) -> Self {
        Self {
            state: Arc::new(Mutex::new(snapshot)),
            in_flight: Arc::default(),
        }
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        self.lock().clone()
    }

    pub fn is_completed(&self, name: &str) -> bool {
        self.lock().completed.contains_key(name)
    }

    pub fn completed_names(&self) -> Vec<String> {
        self.lock().completed.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerSnapshot> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight.entry(name.to_string()).or_default().clone()
    }

    async fn run_attempts(name: &str, config: &DurableConfig, work: &DurableWork) -> Result<Value> {
        let attempts = config.retries.saturating_add(1);
        let mut last_err = anyhow!("durable step '{name}' made no attempts");

        for attempt in 1..=attempts {
            let fut = work();
            let outcome = match config.timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(anyhow!("durable step '{name}' timed out after {limit:?}")),
                },
                None => fut.await,
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt < attempts {
                        warn!(step = %name, attempt, error = %err, "durable step attempt failed; retrying");
                    }
                    last_err = err;
                }
            }
        }

        Err(last_err)
    }

    async fn sleep_towards(&self, name: &str, wake_at: DateTime<Utc>) {
        let wake_at = {
            let mut state = self.lock();
            *state.sleeps.entry(name.to_string()).or_insert(wake_at)
        };

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            debug!(sleep = %name, "durable sleep already elapsed");
            return;
        }

        debug!(sleep = %name, ?remaining, "durable sleep");
        tokio::time::sleep(remaining).await;
    }
}

impl DurableStepRunner for InMemoryStepRunner {
    fn do_step_with_config<'a>(
        &'a self,
        name: &'a str,
        config: DurableConfig,
        work: DurableWork,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let name_lock = self.name_lock(name);
            let _guard = name_lock.lock().await;

            let recorded = self.lock().completed.get(name).cloned();
            if let Some(recorded) = recorded {
                debug!(step = %name, "replaying recorded result");
                return Ok(recorded);
            }

            let value = Self::run_attempts(name, &config, &work).await?;
            self.lock()
                .completed
                .insert(name.to_string(), value.clone());
            Ok(value)
        })
    }

    fn sleep<'a>(&'a self, name: &'a str, duration: Duration) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let offset = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
            let wake_at = Utc::now()
                .checked_add_signed(offset)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.sleep_towards(name, wake_at).await;
        })
    }

    fn sleep_until<'a>(&'a self, name: &'a str, wake_at: DateTime<Utc>) -> BoxFuture<'a, ()> {
        Box::pin(self.sleep_towards(name, wake_at))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn counting_work(calls: Arc<AtomicUsize>, fail_first: usize) -> DurableWork {
        Arc::new(move || -> BoxFuture<'static, Result<Value>> {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < fail_first {
                    Err(anyhow!("boom {n}"))
                } else {
                    Ok(json!(n))
                }
            })
        })
    }

    #[tokio::test]
    async fn completed_step_is_replayed_not_rerun() {
        let runner = InMemoryStepRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = runner.do_step("a", counting_work(calls.clone(), 0)).await.unwrap();
        let second = runner.do_step("a", counting_work(calls.clone(), 0)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_step_is_not_recorded() {
        let runner = InMemoryStepRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(runner.do_step("a", counting_work(calls.clone(), 1)).await.is_err());
        assert!(!runner.is_completed("a"));
        assert_eq!(runner.do_step("a", counting_work(calls.clone(), 1)).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn runner_level_retries() {
        let runner = InMemoryStepRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let config = DurableConfig {
            retries: 2,
            timeout: None,
        };

        let value = runner
            .do_step_with_config("a", config, counting_work(calls.clone(), 2))
            .await
            .unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn snapshot_restores_completed_steps() {
        let runner = InMemoryStepRunner::new();
        runner
            .do_step(
                "a",
                Arc::new(|| -> BoxFuture<'static, Result<Value>> { Box::pin(async { Ok(json!("done")) }) }),
            )
            .await
            .unwrap();

        let resumed = InMemoryStepRunner::from_snapshot(runner.snapshot());
        let calls = Arc::new(AtomicUsize::new(0));
        let value = resumed.do_step("a", counting_work(calls.clone(), 0)).await.unwrap();
        assert_eq!(value, json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_same_name_calls_run_work_once() {
        let runner = InMemoryStepRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let work: DurableWork = {
            let calls = calls.clone();
            Arc::new(move || -> BoxFuture<'static, Result<Value>> {
                let calls = calls.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!(calls.fetch_add(1, Ordering::SeqCst)))
                })
            })
        };

        let (first, second) = tokio::join!(
            runner.do_step("a", work.clone()),
            runner.do_step("a", work.clone())
        );

        assert_eq!(first.unwrap(), second.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn elapsed_sleep_does_not_wait_again() {
        let runner = InMemoryStepRunner::new();
        let past = Utc::now() - chrono::Duration::seconds(10);
        runner.sleep_until("nap", past).await;

        // A later call with the same name keeps the original wake-up time.
        let started = std::time::Instant::now();
        runner.sleep("nap", Duration::from_secs(60)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(runner.snapshot().sleeps.get("nap"), Some(&past));
    }
}
