// src/tier/audit.rs

//! Audit trail of cascade invocations.
//!
//! Every cascade emits [`AuditEvent`]s (who / what / when / where / why /
//! how) to an injected [`AuditSink`], in execution order. Sinks are
//! fire-and-forget: an error or panic inside a sink is logged and otherwise
//! ignored.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::tier::types::CapabilityTier;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    CascadeStarted,
    TierStarted,
    TierSucceeded,
    TierFailed,
    TierSkipped,
    Escalated,
    CascadeSucceeded,
    CascadeFailed,
    CascadeTimedOut,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::CascadeStarted => "cascade_started",
            AuditAction::TierStarted => "tier_started",
            AuditAction::TierSucceeded => "tier_succeeded",
            AuditAction::TierFailed => "tier_failed",
            AuditAction::TierSkipped => "tier_skipped",
            AuditAction::Escalated => "escalated",
            AuditAction::CascadeSucceeded => "cascade_succeeded",
            AuditAction::CascadeFailed => "cascade_failed",
            AuditAction::CascadeTimedOut => "cascade_timed_out",
        };
        f.write_str(s)
    }
}

/// One structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Actor running the cascade.
    pub who: String,
    pub what: AuditAction,
    pub when: DateTime<Utc>,
    /// Cascade location, e.g. `cascade/generative`.
    #[serde(rename = "where")]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub how: Option<String>,
    pub correlation_id: Uuid,
}

impl AuditEvent {
    pub fn new(
        who: impl Into<String>,
        what: AuditAction,
        location: impl Into<String>,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            who: who.into(),
            what,
            when: Utc::now(),
            location: location.into(),
            why: None,
            how: None,
            correlation_id,
        }
    }

    pub fn why(mut self, why: impl Into<String>) -> Self {
        self.why = Some(why.into());
        self
    }

    pub fn how(mut self, how: impl Into<String>) -> Self {
        self.how = Some(how.into());
        self
    }
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn on_event(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Deliver `event`, containing any sink failure.
pub(crate) fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    match catch_unwind(AssertUnwindSafe(|| sink.on_event(&event))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(action = %event.what, error = %err, "audit sink failed; event dropped");
        }
        Err(_) => {
            warn!(action = %event.what, "audit sink panicked; event dropped");
        }
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn on_event(&self, event: &AuditEvent) -> anyhow::Result<()> {
        info!(
            who = %event.who,
            what = %event.what,
            location = %event.location,
            why = event.why.as_deref().unwrap_or(""),
            how = event.how.as_deref().unwrap_or(""),
            correlation_id = %event.correlation_id,
            "audit"
        );
        Ok(())
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.lock().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.lock().iter().map(|e| e.what).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditEvent>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl AuditSink for MemorySink {
    fn on_event(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.lock().push(event.clone());
        Ok(())
    }
}

/// Terminal state of one tier within a cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStepStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

/// Audit trail entry for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStep {
    /// Position in the trail, starting at 0.
    pub id: usize,
    pub tier: CapabilityTier,
    pub status: CascadeStepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Append-only trail of one cascade invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeContext {
    pub correlation_id: Uuid,
    steps: Vec<CascadeStep>,
}

impl CascadeContext {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(
        &mut self,
        tier: CapabilityTier,
        status: CascadeStepStatus,
        start_time: DateTime<Utc>,
        error: Option<String>,
    ) {
        let id = self.steps.len();
        self.steps.push(CascadeStep {
            id,
            tier,
            status,
            start_time,
            end_time: Utc::now(),
            error,
        });
    }

    pub fn steps(&self) -> &[CascadeStep] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploding;

    impl AuditSink for Exploding {
        fn on_event(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            panic!("sink down");
        }
    }

    struct Failing;

    impl AuditSink for Failing {
        fn on_event(&self, _event: &AuditEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    #[test]
    fn sink_failures_are_contained() {
        let id = Uuid::new_v4();
        emit(&Exploding, AuditEvent::new("t", AuditAction::CascadeStarted, "cascade", id));
        emit(&Failing, AuditEvent::new("t", AuditAction::CascadeStarted, "cascade", id));
    }

    #[test]
    fn event_serializes_location_as_where() {
        let event = AuditEvent::new("tierflow", AuditAction::Escalated, "cascade/code", Uuid::nil())
            .why("boom")
            .how("code -> generative");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["where"], "cascade/code");
        assert_eq!(json["what"], "escalated");
        assert_eq!(json["why"], "boom");
    }

    #[test]
    fn context_numbers_steps_in_order() {
        let mut ctx = CascadeContext::new(Uuid::nil());
        ctx.push(CapabilityTier::Code, CascadeStepStatus::Failed, Utc::now(), Some("x".into()));
        ctx.push(CapabilityTier::Human, CascadeStepStatus::Succeeded, Utc::now(), None);
        let ids: Vec<usize> = ctx.steps().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
