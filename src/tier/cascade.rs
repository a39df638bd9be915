// src/tier/cascade.rs

//! Cascade Executor.
//!
//! Tries tier handlers in order until one succeeds:
//!
//! ```text
//! pending -> running(code) -> success
//!                          -> running(generative) -> ... -> running(human)
//!                                                           -> success | AllTiersFailed
//! ```
//!
//! A tier is skipped when it has no handler, when its skip condition holds
//! for the input, or when the attached registry marks it unavailable. Each
//! attempted tier gets its own timeout and retry policy; an optional
//! aggregate deadline bounds the whole invocation and wins over a tier
//! timeout that would fire at the same moment.
//!
//! When a timeout fires, the attempt's [`CancelSignal`] is raised and the
//! handler future is dropped. Child processes spawned with `kill_on_drop`
//! die with it; background work the handler spawned itself should watch
//! the signal.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::CascadeError;
use crate::exec::{BoxFuture, sleep_until_opt};
use crate::exec::retry::RetryConfig;
use crate::exec::step::StepContext;
use crate::tier::audit::{
    AuditAction, AuditEvent, AuditSink, CascadeContext, CascadeStepStatus, TracingSink, emit,
};
use crate::tier::registry::TierRegistry;
use crate::tier::types::{CapabilityTier, TierResult};
use crate::types::StepId;
use crate::workflow::{Step, StepConfig};

/// Error of an earlier tier, visible to later ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierError {
    pub tier: CapabilityTier,
    pub message: String,
}

impl fmt::Display for TierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.tier, self.message)
    }
}

/// Raised when the running attempt has been abandoned.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    fn pair() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Signal that never fires.
    pub fn never() -> Self {
        Self::pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the attempt is cancelled. Never resolves for an attempt
    /// that finishes normally.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Everything a tier handler gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct TierContext {
    pub input: Arc<Value>,
    pub tier: CapabilityTier,
    /// Attempt within this tier, starting at 1.
    pub attempt: u32,
    /// Final errors of every tier attempted before this one, in order.
    pub previous_errors: Vec<TierError>,
    pub correlation_id: Uuid,
    pub cancel: CancelSignal,
}

/// Executes one attempt of a tier.
pub trait TierHandler: Send + Sync {
    fn handle(&self, ctx: TierContext) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> TierHandler for F
where
    F: Fn(TierContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn handle(&self, ctx: TierContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(self(ctx))
    }
}

/// Predicate on the cascade input; `true` skips the tier.
pub type SkipCondition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
struct TierSlot {
    tier: CapabilityTier,
    handler: Option<Arc<dyn TierHandler>>,
    timeout: Option<Duration>,
    retry: RetryConfig,
    skip: Option<SkipCondition>,
}

impl TierSlot {
    fn empty(tier: CapabilityTier) -> Self {
        Self {
            tier,
            handler: None,
            timeout: None,
            retry: RetryConfig::default(),
            skip: None,
        }
    }
}

impl fmt::Debug for TierSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierSlot")
            .field("tier", &self.tier)
            .field("handler", &self.handler.is_some())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("skip", &self.skip.is_some())
            .finish()
    }
}

/// Successful cascade outcome.
#[derive(Debug, Clone)]
pub struct CascadeResult {
    /// Tier that produced the value.
    pub tier: CapabilityTier,
    pub value: Value,
    /// One entry per attempted tier, ending with the successful one.
    pub history: Vec<TierResult>,
    pub skipped_tiers: Vec<CapabilityTier>,
    pub context: CascadeContext,
    pub duration: Duration,
}

/// Builder for [`CascadeExecutor`].
pub struct CascadeBuilder {
    slots: Vec<TierSlot>,
    total_timeout: Option<Duration>,
    sink: Arc<dyn AuditSink>,
    registry: Option<Arc<TierRegistry>>,
    actor: String,
}

impl Default for CascadeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CascadeBuilder {
    /// Builder with the built-in tiers in escalation order and no handlers.
    pub fn new() -> Self {
        Self::with_order(CapabilityTier::BUILT_IN)
    }

    /// Builder with an explicit tier order.
    pub fn with_order(order: impl IntoIterator<Item = CapabilityTier>) -> Self {
        let mut slots: Vec<TierSlot> = Vec::new();
        for tier in order {
            if !slots.iter().any(|s| s.tier == tier) {
                slots.push(TierSlot::empty(tier));
            }
        }
        Self {
            slots,
            total_timeout: None,
            sink: Arc::new(TracingSink),
            registry: None,
            actor: "tierflow".to_string(),
        }
    }

    fn slot(&mut self, tier: CapabilityTier) -> &mut TierSlot {
        let idx = match self.slots.iter().position(|s| s.tier == tier) {
            Some(idx) => idx,
            None => {
                self.slots.push(TierSlot::empty(tier));
                self.slots.len() - 1
            }
        };
        &mut self.slots[idx]
    }

    /// Handler for `tier`. Tiers not yet in the order are appended.
    pub fn handler(mut self, tier: CapabilityTier, handler: impl TierHandler + 'static) -> Self {
        self.slot(tier).handler = Some(Arc::new(handler));
        self
    }

    pub fn shared_handler(mut self, tier: CapabilityTier, handler: Arc<dyn TierHandler>) -> Self {
        self.slot(tier).handler = Some(handler);
        self
    }

    pub fn code(self, handler: impl TierHandler + 'static) -> Self {
        self.handler(CapabilityTier::Code, handler)
    }

    pub fn generative(self, handler: impl TierHandler + 'static) -> Self {
        self.handler(CapabilityTier::Generative, handler)
    }

    pub fn agentic(self, handler: impl TierHandler + 'static) -> Self {
        self.handler(CapabilityTier::Agentic, handler)
    }

    pub fn human(self, handler: impl TierHandler + 'static) -> Self {
        self.handler(CapabilityTier::Human, handler)
    }

    pub fn tier_timeout(mut self, tier: CapabilityTier, timeout: Duration) -> Self {
        self.slot(tier).timeout = Some(timeout);
        self
    }

    pub fn tier_retry(mut self, tier: CapabilityTier, retry: RetryConfig) -> Self {
        self.slot(tier).retry = retry;
        self
    }

    pub fn skip_when<F>(mut self, tier: CapabilityTier, condition: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.slot(tier).skip = Some(Arc::new(condition));
        self
    }

    /// Aggregate deadline for the whole invocation.
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Attach a registry: unavailable tiers get skipped and usage is
    /// recorded into its metrics.
    pub fn registry(mut self, registry: Arc<TierRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Name reported as `who` in audit events.
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn build(self) -> CascadeExecutor {
        CascadeExecutor {
            slots: self.slots,
            total_timeout: self.total_timeout,
            sink: self.sink,
            registry: self.registry,
            actor: self.actor,
        }
    }
}

/// Escalating executor over an ordered list of tiers.
#[derive(Clone)]
pub struct CascadeExecutor {
    slots: Vec<TierSlot>,
    total_timeout: Option<Duration>,
    sink: Arc<dyn AuditSink>,
    registry: Option<Arc<TierRegistry>>,
    actor: String,
}

impl fmt::Debug for CascadeExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeExecutor")
            .field("slots", &self.slots)
            .field("total_timeout", &self.total_timeout)
            .field("registry", &self.registry.is_some())
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

enum AttemptOutcome {
    Done(anyhow::Result<Value>),
    TierTimeout(Duration),
    Deadline,
}

enum TierOutcome {
    Succeeded(TierResult),
    Failed(TierResult),
    /// The aggregate deadline fired during this tier.
    Deadline(TierResult),
}

impl CascadeExecutor {
    pub fn builder() -> CascadeBuilder {
        CascadeBuilder::new()
    }

    /// Cascade along the registry's escalation order (see
    /// [`TierRegistry::escalation_order`]), using each tier's registered
    /// timeout and retry policy. Tiers without a handler in `handlers` are
    /// skipped at run time.
    pub fn from_registry(
        registry: Arc<TierRegistry>,
        handlers: impl IntoIterator<Item = (CapabilityTier, Arc<dyn TierHandler>)>,
    ) -> CascadeBuilder {
        let handlers: BTreeMap<CapabilityTier, Arc<dyn TierHandler>> = handlers.into_iter().collect();
        let mut builder = CascadeBuilder::with_order(registry.escalation_order());

        for slot in builder.slots.iter_mut() {
            if let Some(config) = registry.tier_config(&slot.tier) {
                slot.timeout = config.timeout;
                slot.retry = config.retry;
            }
            slot.handler = handlers.get(&slot.tier).cloned();
        }

        builder.registry(registry)
    }

    /// Tiers in the order they would be tried.
    pub fn tiers(&self) -> Vec<CapabilityTier> {
        self.slots.iter().map(|s| s.tier.clone()).collect()
    }

    pub async fn execute(&self, input: Value) -> Result<CascadeResult, CascadeError> {
        if self.slots.iter().all(|s| s.handler.is_none()) {
            return Err(CascadeError::NoTiersConfigured);
        }

        let started = Instant::now();
        let deadline = self.total_timeout.map(|limit| started + limit);
        let correlation_id = Uuid::new_v4();
        let input = Arc::new(input);

        let mut context = CascadeContext::new(correlation_id);
        let mut history: Vec<TierResult> = Vec::new();
        let mut skipped_tiers: Vec<CapabilityTier> = Vec::new();
        let mut previous_errors: Vec<TierError> = Vec::new();

        info!(%correlation_id, tiers = self.slots.len(), "cascade started");
        self.audit(AuditAction::CascadeStarted, "cascade", correlation_id, None, None);

        for slot in &self.slots {
            if let Some(reason) = self.skip_reason(slot, &input) {
                debug!(%correlation_id, tier = %slot.tier, reason, "tier skipped");
                context.push(slot.tier.clone(), CascadeStepStatus::Skipped, Utc::now(), None);
                skipped_tiers.push(slot.tier.clone());
                self.audit(
                    AuditAction::TierSkipped,
                    &location(&slot.tier),
                    correlation_id,
                    Some(reason.to_string()),
                    None,
                );
                continue;
            }

            if let Some(prev) = previous_errors.last() {
                info!(%correlation_id, from = %prev.tier, to = %slot.tier, "escalating");
                self.audit(
                    AuditAction::Escalated,
                    &location(&slot.tier),
                    correlation_id,
                    Some(prev.message.clone()),
                    Some(format!("{} -> {}", prev.tier, slot.tier)),
                );
            }

            self.audit(
                AuditAction::TierStarted,
                &location(&slot.tier),
                correlation_id,
                None,
                Some(format!("up to {} attempt(s)", slot.retry.attempts())),
            );

            let tier_started_at = Utc::now();
            let outcome = self
                .run_tier(slot, &input, &previous_errors, correlation_id, deadline)
                .await;

            match outcome {
                TierOutcome::Succeeded(result) => {
                    self.record(&result);
                    context.push(slot.tier.clone(), CascadeStepStatus::Succeeded, tier_started_at, None);
                    self.audit(
                        AuditAction::TierSucceeded,
                        &location(&slot.tier),
                        correlation_id,
                        None,
                        Some(format!("attempt {}", result.attempts)),
                    );
                    self.audit(AuditAction::CascadeSucceeded, "cascade", correlation_id, None, None);

                    let value = result.value.clone().unwrap_or(Value::Null);
                    history.push(result);
                    let duration = started.elapsed();
                    info!(%correlation_id, tier = %slot.tier, ?duration, "cascade succeeded");

                    return Ok(CascadeResult {
                        tier: slot.tier.clone(),
                        value,
                        history,
                        skipped_tiers,
                        context,
                        duration,
                    });
                }
                TierOutcome::Failed(result) => {
                    self.record(&result);
                    let message = result.error.clone().unwrap_or_default();
                    let status = if result.timed_out {
                        CascadeStepStatus::TimedOut
                    } else {
                        CascadeStepStatus::Failed
                    };
                    warn!(%correlation_id, tier = %slot.tier, error = %message, "tier failed");
                    context.push(slot.tier.clone(), status, tier_started_at, Some(message.clone()));
                    self.audit(
                        AuditAction::TierFailed,
                        &location(&slot.tier),
                        correlation_id,
                        Some(message.clone()),
                        Some(format!("{} attempt(s)", result.attempts)),
                    );
                    previous_errors.push(TierError {
                        tier: slot.tier.clone(),
                        message,
                    });
                    history.push(result);
                }
                TierOutcome::Deadline(result) => {
                    self.record(&result);
                    context.push(
                        slot.tier.clone(),
                        CascadeStepStatus::TimedOut,
                        tier_started_at,
                        result.error.clone(),
                    );
                    history.push(result);
                    return Err(self.timed_out(started, correlation_id, history));
                }
            }
        }

        warn!(%correlation_id, attempted = history.len(), "all tiers failed");
        self.audit(
            AuditAction::CascadeFailed,
            "cascade",
            correlation_id,
            previous_errors.last().map(|e| e.message.clone()),
            Some(format!("{} tier(s) attempted", history.len())),
        );
        Err(CascadeError::AllTiersFailed { history })
    }

    /// Wrap this cascade as a workflow step. The tier input is the step
    /// context as `{"input": .., "results": {..}}`.
    pub fn into_step(self: Arc<Self>, id: impl Into<StepId>, config: StepConfig) -> Step {
        Step::with_config(id, config, move |ctx: StepContext| {
            let cascade = self.clone();
            async move {
                let result = cascade.execute(ctx.to_value()).await?;
                Ok(result.value)
            }
        })
    }

    fn skip_reason(&self, slot: &TierSlot, input: &Value) -> Option<&'static str> {
        if slot.handler.is_none() {
            return Some("no handler configured");
        }
        if slot.skip.as_ref().is_some_and(|cond| cond(input)) {
            return Some("skip condition matched");
        }
        let unavailable = self
            .registry
            .as_ref()
            .is_some_and(|r| r.is_registered(&slot.tier) && !r.is_tier_available(&slot.tier));
        if unavailable {
            return Some("tier unavailable");
        }
        None
    }

    async fn run_tier(
        &self,
        slot: &TierSlot,
        input: &Arc<Value>,
        previous_errors: &[TierError],
        correlation_id: Uuid,
        deadline: Option<Instant>,
    ) -> TierOutcome {
        let tier_started = Instant::now();
        let attempts = slot.retry.attempts();
        let mut last_error = String::new();
        let mut timed_out = false;

        let Some(handler) = slot.handler.clone() else {
            return TierOutcome::Failed(self.tier_result(slot, tier_started, 0, Err("no handler".into()), false));
        };

        for attempt in 1..=attempts {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let err = Err("cascade deadline exceeded".to_string());
                return TierOutcome::Deadline(self.tier_result(slot, tier_started, attempt - 1, err, true));
            }

            let (cancel_tx, cancel) = CancelSignal::pair();
            let ctx = TierContext {
                input: input.clone(),
                tier: slot.tier.clone(),
                attempt,
                previous_errors: previous_errors.to_vec(),
                correlation_id,
                cancel,
            };

            debug!(%correlation_id, tier = %slot.tier, attempt, "tier attempt starting");
            let fut = handler.handle(ctx);
            let outcome = race(fut, slot.timeout, deadline).await;
            if !matches!(outcome, AttemptOutcome::Done(_)) {
                let _ = cancel_tx.send(true);
            }

            match outcome {
                AttemptOutcome::Done(Ok(value)) => {
                    return TierOutcome::Succeeded(self.tier_result(slot, tier_started, attempt, Ok(value), false));
                }
                AttemptOutcome::Done(Err(err)) => {
                    last_error = format!("{err:#}");
                    timed_out = false;
                }
                AttemptOutcome::TierTimeout(limit) => {
                    last_error = format!("tier '{}' timed out after {limit:?}", slot.tier);
                    timed_out = true;
                }
                AttemptOutcome::Deadline => {
                    let err = Err("cascade deadline exceeded".to_string());
                    return TierOutcome::Deadline(self.tier_result(slot, tier_started, attempt, err, true));
                }
            }

            if attempt < attempts {
                let delay = slot.retry.delay_for_attempt(attempt);
                debug!(%correlation_id, tier = %slot.tier, attempt, ?delay, error = %last_error, "tier attempt failed; backing off");
                tokio::select! {
                    biased;
                    _ = sleep_until_opt(deadline) => {
                        let err = Err(last_error);
                        return TierOutcome::Deadline(self.tier_result(slot, tier_started, attempt, err, true));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        TierOutcome::Failed(self.tier_result(slot, tier_started, attempts, Err(last_error), timed_out))
    }

    fn tier_result(
        &self,
        slot: &TierSlot,
        started: Instant,
        attempts: u32,
        outcome: Result<Value, String>,
        timed_out: bool,
    ) -> TierResult {
        let (success, value, error) = match outcome {
            Ok(v) => (true, Some(v), None),
            Err(e) => (false, None, Some(e)),
        };
        TierResult {
            tier: slot.tier.clone(),
            success,
            value,
            error,
            timed_out,
            duration: started.elapsed(),
            attempts,
        }
    }

    fn timed_out(&self, started: Instant, correlation_id: Uuid, history: Vec<TierResult>) -> CascadeError {
        let elapsed = started.elapsed();
        let limit = self.total_timeout.unwrap_or(elapsed);
        warn!(%correlation_id, ?limit, ?elapsed, "cascade deadline exceeded");
        self.audit(
            AuditAction::CascadeTimedOut,
            "cascade",
            correlation_id,
            Some(format!("exceeded {limit:?}")),
            Some(format!("{} tier(s) attempted", history.len())),
        );
        CascadeError::CascadeTimeout {
            limit,
            elapsed,
            history,
        }
    }

    fn record(&self, result: &TierResult) {
        if let Some(registry) = &self.registry {
            registry.record_tier_usage(&result.tier, Some(result.duration));
            registry.record_tier_result(&result.tier, result.success);
        }
    }

    fn audit(
        &self,
        what: AuditAction,
        location: &str,
        correlation_id: Uuid,
        why: Option<String>,
        how: Option<String>,
    ) {
        let mut event = AuditEvent::new(self.actor.clone(), what, location, correlation_id);
        event.why = why;
        event.how = how;
        emit(self.sink.as_ref(), event);
    }
}

fn location(tier: &CapabilityTier) -> String {
    format!("cascade/{tier}")
}

/// Race one handler attempt against the tier timeout and the aggregate
/// deadline. The deadline is polled first so it wins ties.
async fn race(
    fut: BoxFuture<'static, anyhow::Result<Value>>,
    tier_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> AttemptOutcome {
    tokio::select! {
        biased;
        _ = sleep_until_opt(deadline) => AttemptOutcome::Deadline,
        _ = sleep_opt(tier_timeout) => match tier_timeout {
            Some(limit) => AttemptOutcome::TierTimeout(limit),
            None => AttemptOutcome::Deadline,
        },
        res = fut => AttemptOutcome::Done(res),
    }
}

async fn sleep_opt(duration: Option<Duration>) {
    match duration {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::anyhow;
    use serde_json::json;

    use super::*;
    use crate::tier::audit::MemorySink;

    #[tokio::test]
    async fn retries_within_a_tier_before_escalating() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let cascade = CascadeExecutor::builder()
            .code(move |_ctx: TierContext| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("flaky"))
                    } else {
                        Ok(json!("third time"))
                    }
                }
            })
            .tier_retry(
                CapabilityTier::Code,
                RetryConfig::with_max_retries(2).base_delay(Duration::from_millis(1)),
            )
            .build();

        let result = cascade.execute(json!(null)).await.unwrap();
        assert_eq!(result.tier, CapabilityTier::Code);
        assert_eq!(result.history[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn tier_timeout_escalates_with_timed_out_flag() {
        let cascade = CascadeExecutor::builder()
            .code(|_ctx: TierContext| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            })
            .tier_timeout(CapabilityTier::Code, Duration::from_millis(20))
            .generative(|_ctx: TierContext| async { Ok(json!("ok")) })
            .build();

        let result = cascade.execute(json!(null)).await.unwrap();
        assert_eq!(result.tier, CapabilityTier::Generative);
        assert!(result.history[0].timed_out);
        assert!(!result.history[1].timed_out);
    }

    #[tokio::test]
    async fn no_handlers_is_an_error() {
        let err = CascadeExecutor::builder().build().execute(json!(1)).await.unwrap_err();
        assert!(matches!(err, CascadeError::NoTiersConfigured));
    }

    #[tokio::test]
    async fn audit_events_follow_execution_order() {
        let sink = Arc::new(MemorySink::new());
        let cascade = CascadeExecutor::builder()
            .code(|_ctx: TierContext| async { Err(anyhow!("nope")) })
            .human(|_ctx: TierContext| async { Ok(json!("approved")) })
            .event_sink(sink.clone())
            .build();

        cascade.execute(json!({})).await.unwrap();

        assert_eq!(
            sink.actions(),
            vec![
                AuditAction::CascadeStarted,
                AuditAction::TierStarted,
                AuditAction::TierFailed,
                AuditAction::TierSkipped,
                AuditAction::TierSkipped,
                AuditAction::Escalated,
                AuditAction::TierStarted,
                AuditAction::TierSucceeded,
                AuditAction::CascadeSucceeded,
            ]
        );
        let ids: Vec<Uuid> = sink.events().iter().map(|e| e.correlation_id).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn cancel_signal_fires_on_deadline() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel::<()>();
        let seen_tx = Arc::new(std::sync::Mutex::new(Some(seen_tx)));

        let cascade = CascadeExecutor::builder()
            .code(move |ctx: TierContext| {
                let seen_tx = seen_tx.clone();
                async move {
                    let cancel = ctx.cancel.clone();
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        if let Some(tx) = seen_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                    });
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }
            })
            .total_timeout(Duration::from_millis(20))
            .build();

        let err = cascade.execute(json!(null)).await.unwrap_err();
        assert!(matches!(err, CascadeError::CascadeTimeout { .. }));
        tokio::time::timeout(Duration::from_secs(1), seen_rx)
            .await
            .expect("cancel signal not observed")
            .unwrap();
    }
}
