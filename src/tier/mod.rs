// src/tier/mod.rs

//! Capability tiers and escalation.
//!
//! - [`types`] defines tiers, priorities, per-tier results and metrics.
//! - [`registry`] routes failures and priorities to tiers and keeps metrics.
//! - [`cascade`] tries tier handlers in order until one succeeds.
//! - [`audit`] carries the structured audit trail of a cascade.

pub mod audit;
pub mod cascade;
pub mod registry;
pub mod types;

pub use audit::{
    AuditAction, AuditEvent, AuditSink, CascadeContext, CascadeStep, CascadeStepStatus, MemorySink,
    TracingSink,
};
pub use cascade::{
    CancelSignal, CascadeBuilder, CascadeExecutor, CascadeResult, SkipCondition, TierContext,
    TierError, TierHandler,
};
pub use registry::{FailurePattern, TierRegistry};
pub use types::{CapabilityTier, Priority, TierConfig, TierMetrics, TierResult};
