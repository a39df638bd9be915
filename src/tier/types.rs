// src/tier/types.rs

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::exec::retry::RetryConfig;

/// One rung of the escalation ladder.
///
/// Built-in tiers run in the order `code -> generative -> agentic -> human`.
/// Any other name becomes a [`CapabilityTier::Custom`] tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CapabilityTier {
    Code,
    Generative,
    Agentic,
    Human,
    Custom(String),
}

impl CapabilityTier {
    /// Built-in tiers in escalation order.
    pub const BUILT_IN: [CapabilityTier; 4] = [
        CapabilityTier::Code,
        CapabilityTier::Generative,
        CapabilityTier::Agentic,
        CapabilityTier::Human,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            CapabilityTier::Code => "code",
            CapabilityTier::Generative => "generative",
            CapabilityTier::Agentic => "agentic",
            CapabilityTier::Human => "human",
            CapabilityTier::Custom(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, CapabilityTier::Custom(_))
    }

    /// Priority used when a tier is registered without an explicit one.
    /// Custom tiers sort after all built-ins.
    pub fn default_priority(&self) -> i32 {
        match self {
            CapabilityTier::Code => 0,
            CapabilityTier::Generative => 1,
            CapabilityTier::Agentic => 2,
            CapabilityTier::Human => 3,
            CapabilityTier::Custom(_) => 100,
        }
    }
}

impl From<&str> for CapabilityTier {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "code" => CapabilityTier::Code,
            "generative" => CapabilityTier::Generative,
            "agentic" => CapabilityTier::Agentic,
            "human" => CapabilityTier::Human,
            _ => CapabilityTier::Custom(s.trim().to_string()),
        }
    }
}

impl From<String> for CapabilityTier {
    fn from(s: String) -> Self {
        CapabilityTier::from(s.as_str())
    }
}

impl From<CapabilityTier> for String {
    fn from(tier: CapabilityTier) -> Self {
        tier.as_str().to_string()
    }
}

impl FromStr for CapabilityTier {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CapabilityTier::from(s))
    }
}

impl fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency of a piece of work, mapped to a tier by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Critical,
    ];
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!(
                "invalid priority '{other}', expected one of: low, normal, high, critical"
            )),
        }
    }
}

/// Registry-side configuration of a tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierConfig {
    /// Lower runs first.
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub retry: RetryConfig,
    pub available: bool,
}

impl TierConfig {
    /// Available tier with its default priority, no timeout and no retries.
    pub fn for_tier(tier: &CapabilityTier) -> Self {
        Self {
            priority: tier.default_priority(),
            timeout: None,
            retry: RetryConfig::default(),
            available: true,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }
}

/// Outcome of one attempted tier within a cascade.
#[derive(Debug, Clone, PartialEq)]
pub struct TierResult {
    pub tier: CapabilityTier,
    pub success: bool,
    pub value: Option<Value>,
    pub error: Option<String>,
    /// The last attempt ended because a timeout fired.
    pub timed_out: bool,
    pub duration: Duration,
    pub attempts: u32,
}

/// Usage counters of one tier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierMetrics {
    pub usage_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Running average over `usage_count`. A usage without a duration
    /// counts towards `n` but adds nothing to the sum.
    pub avg_duration_ms: f64,
}

impl TierMetrics {
    /// `success / (success + failure)`, or `None` before any result.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            None
        } else {
            Some(self.success_count as f64 / total as f64)
        }
    }

    pub(crate) fn record_usage(&mut self, duration: Option<Duration>) {
        self.usage_count += 1;
        if let Some(d) = duration {
            let n = self.usage_count as f64;
            let ms = d.as_secs_f64() * 1000.0;
            self.avg_duration_ms = (self.avg_duration_ms * (n - 1.0) + ms) / n;
        }
    }

    pub(crate) fn record_result(&mut self, success: bool) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_names_round_trip_through_strings() {
        assert_eq!(CapabilityTier::from("Human"), CapabilityTier::Human);
        assert_eq!(
            CapabilityTier::from("legal-review"),
            CapabilityTier::Custom("legal-review".into())
        );
        assert_eq!(CapabilityTier::Agentic.to_string(), "agentic");
    }

    #[test]
    fn running_average_folds_durations() {
        let mut m = TierMetrics::default();
        m.record_usage(Some(Duration::from_millis(100)));
        m.record_usage(Some(Duration::from_millis(300)));
        assert_eq!(m.usage_count, 2);
        assert!((m.avg_duration_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn usage_without_duration_still_counts_towards_average() {
        let mut m = TierMetrics::default();
        m.record_usage(None);
        assert_eq!(m.usage_count, 1);
        assert_eq!(m.avg_duration_ms, 0.0);

        m.record_usage(Some(Duration::from_millis(100)));
        assert_eq!(m.usage_count, 2);
        assert!((m.avg_duration_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn success_rate_is_none_without_results() {
        let mut m = TierMetrics::default();
        assert_eq!(m.success_rate(), None);
        m.record_result(true);
        m.record_result(false);
        m.record_result(true);
        m.record_result(true);
        assert_eq!(m.success_rate(), Some(0.75));
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("CRITICAL".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }
}
