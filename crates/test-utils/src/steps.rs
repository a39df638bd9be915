#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tierflow::{Step, StepContext};

/// Shared record of which step work functions were invoked, in call order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str) {
        self.calls.lock().unwrap().push(id.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == id).count()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c == id)
    }
}

/// Step returning `value`.
pub fn value_step(id: &str, value: Value, log: &CallLog) -> Step {
    let log = log.clone();
    Step::new(id, move |ctx: StepContext| {
        log.record(ctx.step_id());
        let value = value.clone();
        async move { Ok(value) }
    })
}

/// Step that always fails with `message`.
pub fn failing_step(id: &str, message: &str, log: &CallLog) -> Step {
    let log = log.clone();
    let message = message.to_string();
    Step::new(id, move |ctx: StepContext| {
        log.record(ctx.step_id());
        let message = message.clone();
        async move { Err(anyhow!(message)) }
    })
}

/// Step that sleeps for `duration`, then returns `value`.
pub fn sleeping_step(id: &str, duration: Duration, value: Value, log: &CallLog) -> Step {
    let log = log.clone();
    Step::new(id, move |ctx: StepContext| {
        log.record(ctx.step_id());
        let value = value.clone();
        async move {
            tokio::time::sleep(duration).await;
            Ok(value)
        }
    })
}

/// Step that fails `failures` times before returning `value`.
pub fn flaky_step(id: &str, failures: u32, value: Value, log: &CallLog) -> Step {
    let log = log.clone();
    Step::new(id, move |ctx: StepContext| {
        log.record(ctx.step_id());
        let value = value.clone();
        let attempt = ctx.attempt();
        async move {
            if attempt <= failures {
                Err(anyhow!("attempt {attempt} failed"))
            } else {
                Ok(value)
            }
        }
    })
}

/// Step returning the results it saw as a JSON object.
pub fn echo_results_step(id: &str, log: &CallLog) -> Step {
    let log = log.clone();
    Step::new(id, move |ctx: StepContext| {
        log.record(ctx.step_id());
        let seen = serde_json::to_value(ctx.results()).unwrap_or(Value::Null);
        async move { Ok(seen) }
    })
}
