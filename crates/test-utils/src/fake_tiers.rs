use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tierflow::exec::BoxFuture;
use tierflow::tier::{TierContext, TierError, TierHandler};

/// What a [`RecordingTier`] does when invoked.
#[derive(Debug, Clone)]
pub enum TierBehaviour {
    Succeed(Value),
    Fail(String),
    /// Fail the first `n` calls, then succeed.
    FailTimes(u32, Value),
    /// Sleep, then succeed.
    Sleep(Duration, Value),
}

/// A fake tier handler that:
/// - counts invocations
/// - keeps every `TierContext` it received
/// - behaves according to its `TierBehaviour`.
#[derive(Debug, Clone)]
pub struct RecordingTier {
    behaviour: TierBehaviour,
    calls: Arc<AtomicU32>,
    contexts: Arc<Mutex<Vec<TierContext>>>,
}

impl RecordingTier {
    pub fn new(behaviour: TierBehaviour) -> Self {
        Self {
            behaviour,
            calls: Arc::new(AtomicU32::new(0)),
            contexts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn succeed(value: Value) -> Self {
        Self::new(TierBehaviour::Succeed(value))
    }

    pub fn fail(message: &str) -> Self {
        Self::new(TierBehaviour::Fail(message.to_string()))
    }

    pub fn sleep(duration: Duration, value: Value) -> Self {
        Self::new(TierBehaviour::Sleep(duration, value))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<TierContext> {
        self.contexts.lock().unwrap().clone()
    }

    /// `previous_errors` seen by the most recent call.
    pub fn last_previous_errors(&self) -> Vec<TierError> {
        self.contexts
            .lock()
            .unwrap()
            .last()
            .map(|c| c.previous_errors.clone())
            .unwrap_or_default()
    }

    pub fn handler(&self) -> Arc<dyn TierHandler> {
        Arc::new(self.clone())
    }
}

impl TierHandler for RecordingTier {
    fn handle(&self, ctx: TierContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(ctx);
        let behaviour = self.behaviour.clone();

        Box::pin(async move {
            match behaviour {
                TierBehaviour::Succeed(v) => Ok(v),
                TierBehaviour::Fail(msg) => Err(anyhow!(msg)),
                TierBehaviour::FailTimes(times, v) => {
                    if n < times {
                        Err(anyhow!("failure {} of {times}", n + 1))
                    } else {
                        Ok(v)
                    }
                }
                TierBehaviour::Sleep(d, v) => {
                    tokio::time::sleep(d).await;
                    Ok(v)
                }
            }
        })
    }
}
