// src/tier/registry.rs

//! Tier Registry.
//!
//! Routing table from failure types and priorities to capability tiers,
//! plus per-tier configuration, availability, fallback chains and metrics.
//! All methods take `&self`; one registry can be shared behind an `Arc` by
//! many concurrent cascades. Metrics of each tier sit behind their own lock
//! so concurrent recordings on different tiers never contend.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::tier::types::{CapabilityTier, Priority, TierConfig, TierMetrics};

/// Matcher for a failure type.
#[derive(Debug, Clone)]
pub enum FailurePattern {
    Exact(String),
    Regex(Regex),
}

impl FailurePattern {
    /// Compile a regular-expression pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(FailurePattern::Regex(Regex::new(pattern)?))
    }

    pub fn matches(&self, failure: &str) -> bool {
        match self {
            FailurePattern::Exact(s) => s == failure,
            FailurePattern::Regex(re) => re.is_match(failure),
        }
    }

    fn same_as(&self, other: &FailurePattern) -> bool {
        match (self, other) {
            (FailurePattern::Exact(a), FailurePattern::Exact(b)) => a == b,
            (FailurePattern::Regex(a), FailurePattern::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl From<&str> for FailurePattern {
    fn from(s: &str) -> Self {
        FailurePattern::Exact(s.to_string())
    }
}

impl From<String> for FailurePattern {
    fn from(s: String) -> Self {
        FailurePattern::Exact(s)
    }
}

impl From<Regex> for FailurePattern {
    fn from(re: Regex) -> Self {
        FailurePattern::Regex(re)
    }
}

impl fmt::Display for FailurePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePattern::Exact(s) => write!(f, "{s}"),
            FailurePattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct FailureRoute {
    pattern: FailurePattern,
    tier: CapabilityTier,
}

#[derive(Debug, Default)]
struct FallbackState {
    explicit: HashMap<CapabilityTier, Vec<CapabilityTier>>,
    auto: bool,
}

/// Shared routing table for capability tiers.
#[derive(Debug, Default)]
pub struct TierRegistry {
    tiers: RwLock<HashMap<CapabilityTier, TierConfig>>,
    /// Failure routes in registration order; the first match wins.
    routes: RwLock<Vec<FailureRoute>>,
    priorities: RwLock<HashMap<Priority, CapabilityTier>>,
    fallback: RwLock<FallbackState>,
    metrics: RwLock<HashMap<CapabilityTier, Arc<Mutex<TierMetrics>>>>,
}

impl TierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in tiers registered at their default
    /// priorities.
    pub fn with_builtin_tiers() -> Self {
        let registry = Self::new();
        for tier in CapabilityTier::BUILT_IN {
            let config = TierConfig::for_tier(&tier);
            registry.register_tier(tier, config);
        }
        registry
    }

    // ---------------------------------------------------------------------
    // Tiers
    // ---------------------------------------------------------------------

    /// Register `tier`, or update its configuration in place.
    pub fn register_tier(&self, tier: CapabilityTier, config: TierConfig) {
        debug!(tier = %tier, priority = config.priority, available = config.available, "registering tier");
        write(&self.tiers).insert(tier, config);
    }

    /// Remove a tier. Its routes and metrics are left untouched.
    pub fn unregister_tier(&self, tier: &CapabilityTier) -> Option<TierConfig> {
        write(&self.tiers).remove(tier)
    }

    pub fn tier_config(&self, tier: &CapabilityTier) -> Option<TierConfig> {
        read(&self.tiers).get(tier).cloned()
    }

    pub fn is_registered(&self, tier: &CapabilityTier) -> bool {
        read(&self.tiers).contains_key(tier)
    }

    /// Registered tiers sorted by ascending priority, ties broken by name.
    pub fn tiers_by_priority(&self) -> Vec<CapabilityTier> {
        let tiers = read(&self.tiers);
        let mut sorted: Vec<(&CapabilityTier, i32)> =
            tiers.iter().map(|(t, c)| (t, c.priority)).collect();
        sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        sorted.into_iter().map(|(t, _)| t.clone()).collect()
    }

    /// Registered and not marked unavailable.
    pub fn is_tier_available(&self, tier: &CapabilityTier) -> bool {
        read(&self.tiers).get(tier).is_some_and(|c| c.available)
    }

    /// Flip availability of a registered tier. Returns `false` when the tier
    /// is unknown.
    pub fn set_tier_availability(&self, tier: &CapabilityTier, available: bool) -> bool {
        match write(&self.tiers).get_mut(tier) {
            Some(config) => {
                if config.available != available {
                    info!(tier = %tier, available, "tier availability changed");
                }
                config.available = available;
                true
            }
            None => false,
        }
    }

    fn priority_of(&self, tier: &CapabilityTier) -> i32 {
        read(&self.tiers)
            .get(tier)
            .map(|c| c.priority)
            .unwrap_or_else(|| tier.default_priority())
    }

    // ---------------------------------------------------------------------
    // Failure routing
    // ---------------------------------------------------------------------

    /// Route failures matching `pattern` to `tier`.
    ///
    /// Routes are consulted in registration order. Mapping an already
    /// registered pattern again retargets it without changing its position.
    pub fn map_failure_to_tier(&self, pattern: impl Into<FailurePattern>, tier: CapabilityTier) {
        let pattern = pattern.into();
        let mut routes = write(&self.routes);
        if let Some(existing) = routes.iter_mut().find(|r| r.pattern.same_as(&pattern)) {
            existing.tier = tier;
            return;
        }
        routes.push(FailureRoute { pattern, tier });
    }

    /// Convenience for regular-expression routes.
    pub fn map_failure_pattern(&self, pattern: &str, tier: CapabilityTier) -> Result<(), regex::Error> {
        self.map_failure_to_tier(FailurePattern::regex(pattern)?, tier);
        Ok(())
    }

    /// Tier of the first route matching `failure_type`.
    pub fn route_to_tier(&self, failure_type: &str) -> Option<CapabilityTier> {
        let routed = read(&self.routes)
            .iter()
            .find(|r| r.pattern.matches(failure_type))
            .map(|r| r.tier.clone());
        debug!(failure = %failure_type, tier = ?routed, "routed failure");
        routed
    }

    /// Registered routes in lookup order.
    pub fn routes(&self) -> Vec<(FailurePattern, CapabilityTier)> {
        read(&self.routes)
            .iter()
            .map(|r| (r.pattern.clone(), r.tier.clone()))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Priorities
    // ---------------------------------------------------------------------

    pub fn set_priority_tier(&self, priority: Priority, tier: CapabilityTier) {
        write(&self.priorities).insert(priority, tier);
    }

    /// Tier handling work of the given priority.
    ///
    /// Defaults: `low -> code`, `normal -> generative`, `high -> agentic`,
    /// `critical -> human` (or, without a registered human tier, the
    /// registered tier with the highest priority value).
    pub fn get_tier_for_priority(&self, priority: Priority) -> CapabilityTier {
        if let Some(tier) = read(&self.priorities).get(&priority) {
            return tier.clone();
        }

        match priority {
            Priority::Low => CapabilityTier::Code,
            Priority::Normal => CapabilityTier::Generative,
            Priority::High => CapabilityTier::Agentic,
            Priority::Critical => {
                if self.is_registered(&CapabilityTier::Human) {
                    CapabilityTier::Human
                } else {
                    self.tiers_by_priority()
                        .pop()
                        .unwrap_or(CapabilityTier::Human)
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Fallback chains
    // ---------------------------------------------------------------------

    /// Explicit fallback order after `tier`. Overrides auto-derivation for
    /// that tier.
    pub fn set_fallback_chain(&self, tier: CapabilityTier, chain: Vec<CapabilityTier>) {
        write(&self.fallback).explicit.insert(tier, chain);
    }

    /// Derive chains from ascending tier priority for tiers without an
    /// explicit chain.
    pub fn enable_auto_fallback(&self) {
        write(&self.fallback).auto = true;
    }

    pub fn auto_fallback_enabled(&self) -> bool {
        read(&self.fallback).auto
    }

    /// Candidates after `tier`, ignoring availability.
    pub fn fallback_chain(&self, tier: &CapabilityTier) -> Vec<CapabilityTier> {
        let (explicit, auto) = {
            let state = read(&self.fallback);
            (state.explicit.get(tier).cloned(), state.auto)
        };
        if let Some(chain) = explicit {
            return chain;
        }
        if !auto {
            return Vec::new();
        }

        let own = self.priority_of(tier);
        let tiers = read(&self.tiers);
        let mut higher: Vec<(&CapabilityTier, i32)> = tiers
            .iter()
            .filter(|(t, c)| *t != tier && c.priority > own)
            .map(|(t, c)| (t, c.priority))
            .collect();
        higher.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        higher.into_iter().map(|(t, _)| t.clone()).collect()
    }

    /// First available tier in the fallback chain of `tier`.
    ///
    /// `None` means escalation is exhausted; that is a terminal signal for
    /// the caller, not an error.
    pub fn get_next_available_fallback(&self, tier: &CapabilityTier) -> Option<CapabilityTier> {
        self.fallback_chain(tier)
            .into_iter()
            .find(|t| self.is_tier_available(t))
    }

    /// Full escalation path starting at the lowest-priority tier.
    ///
    /// Each step follows the current tier's fallback chain when it has one,
    /// otherwise the remaining tiers in priority order. Unregistered chain
    /// entries and repeats are dropped. Availability is not consulted.
    pub fn escalation_order(&self) -> Vec<CapabilityTier> {
        let by_priority = self.tiers_by_priority();
        let Some(first) = by_priority.first().cloned() else {
            return Vec::new();
        };

        let mut order = vec![first.clone()];
        let mut current = first;
        loop {
            let mut candidates = self.fallback_chain(&current);
            if candidates.is_empty() {
                candidates = by_priority
                    .iter()
                    .skip_while(|t| **t != current)
                    .skip(1)
                    .cloned()
                    .collect();
            }

            let before = order.len();
            for tier in candidates {
                if self.is_registered(&tier) && !order.contains(&tier) {
                    order.push(tier);
                }
            }
            if order.len() == before {
                return order;
            }
            current = order[order.len() - 1].clone();
        }
    }

    // ---------------------------------------------------------------------
    // Metrics
    // ---------------------------------------------------------------------

    /// Count one use of `tier`, folding `duration` into its running average.
    pub fn record_tier_usage(&self, tier: &CapabilityTier, duration: Option<Duration>) {
        let cell = self.metrics_cell(tier);
        lock(&cell).record_usage(duration);
    }

    pub fn record_tier_result(&self, tier: &CapabilityTier, success: bool) {
        let cell = self.metrics_cell(tier);
        lock(&cell).record_result(success);
    }

    /// Snapshot of the metrics of `tier` (zeroed when never recorded).
    pub fn metrics(&self, tier: &CapabilityTier) -> TierMetrics {
        read(&self.metrics)
            .get(tier)
            .map(|cell| lock(cell).clone())
            .unwrap_or_default()
    }

    pub fn success_rate(&self, tier: &CapabilityTier) -> Option<f64> {
        self.metrics(tier).success_rate()
    }

    /// Zero the metrics of one tier, or of all tiers when `tier` is `None`.
    pub fn reset_metrics(&self, tier: Option<&CapabilityTier>) {
        let metrics = read(&self.metrics);
        match tier {
            Some(t) => {
                if let Some(cell) = metrics.get(t) {
                    *lock(cell) = TierMetrics::default();
                }
            }
            None => {
                for cell in metrics.values() {
                    *lock(cell) = TierMetrics::default();
                }
            }
        }
    }

    fn metrics_cell(&self, tier: &CapabilityTier) -> Arc<Mutex<TierMetrics>> {
        if let Some(cell) = read(&self.metrics).get(tier) {
            return cell.clone();
        }
        write(&self.metrics)
            .entry(tier.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TierMetrics::default())))
            .clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
