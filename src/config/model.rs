// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::exec::level::ExecutionOptions;
use crate::exec::retry::RetryConfig;
use crate::tier::types::{CapabilityTier, Priority, TierConfig};
use crate::workflow::Trigger;

/// Top-level configuration exactly as read from a TOML file.
///
/// ```toml
/// [config]
/// continue_on_error = false
/// max_concurrency = 4
/// step_timeout = "30s"
/// run_timeout = "10m"
///
/// [retry]
/// limit = 1
/// base_delay = "200ms"
///
/// [step.build]
/// cmd = "make"
/// after = ["fetch"]
/// escalate = ["generative"]
///
/// [tier.generative]
/// cmd = "llm-fix"
/// timeout = "60s"
///
/// [routing]
/// exact = { "timeout" = "code" }
/// patterns = [ { pattern = "^auth", tier = "human" } ]
///
/// [priority]
/// critical = "human"
///
/// [[trigger]]
/// event = "push"
/// ```
///
/// All sections except `[step.<name>]` are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub config: ConfigSection,

    /// Default step retry policy from `[retry]`.
    #[serde(default)]
    pub retry: RetrySection,

    /// Keys are step ids.
    #[serde(default)]
    pub step: BTreeMap<String, StepSection>,

    /// Keys are tier names; built-in names override the built-in tiers.
    #[serde(default)]
    pub tier: BTreeMap<String, TierSection>,

    #[serde(default)]
    pub routing: RoutingSection,

    /// `priority name -> tier name`.
    #[serde(default)]
    pub priority: BTreeMap<String, String>,

    #[serde(default)]
    pub trigger: Vec<TriggerSection>,
}

/// `[config]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigSection {
    #[serde(default)]
    pub continue_on_error: bool,

    /// Per-level bound on concurrently running steps.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Default per-attempt step timeout (e.g. `"30s"`).
    #[serde(default)]
    pub step_timeout: Option<String>,

    /// Aggregate deadline for every cascade.
    #[serde(default)]
    pub cascade_timeout: Option<String>,

    /// Limit on a whole workflow run.
    #[serde(default)]
    pub run_timeout: Option<String>,

    /// Derive fallback chains from tier priorities.
    #[serde(default)]
    pub auto_fallback: bool,
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Total attempts per step.
    #[serde(default = "default_retry_limit")]
    pub limit: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay: String,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default)]
    pub max_delay: Option<String>,
}

fn default_retry_limit() -> u32 {
    1
}

fn default_base_delay() -> String {
    "200ms".to_string()
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            limit: default_retry_limit(),
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: None,
        }
    }
}

/// `[step.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StepSection {
    /// Shell command; for escalating steps this is the code tier.
    pub cmd: String,

    /// Hard dependencies.
    #[serde(default)]
    pub after: Vec<String>,

    /// Soft dependencies.
    #[serde(default)]
    pub soft_after: Vec<String>,

    #[serde(default)]
    pub timeout: Option<String>,

    /// Retries after the first attempt; overrides `[retry].limit`.
    #[serde(default)]
    pub retries: Option<u32>,

    /// Tiers to escalate to when `cmd` fails, in order.
    #[serde(default)]
    pub escalate: Vec<String>,
}

/// `[tier.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TierSection {
    /// Command run when a step escalates to this tier.
    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub timeout: Option<String>,

    #[serde(default)]
    pub max_retries: u32,

    #[serde(default)]
    pub base_delay: Option<String>,

    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

/// `[routing]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoutingSection {
    /// `failure type -> tier name`.
    #[serde(default)]
    pub exact: BTreeMap<String, String>,

    /// Regex routes, consulted after exact ones in file order.
    #[serde(default)]
    pub patterns: Vec<PatternRoute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatternRoute {
    pub pattern: String,
    pub tier: String,
}

/// `[[trigger]]` entry; exactly one of `event` / `cron`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerSection {
    #[serde(default)]
    pub event: Option<String>,

    #[serde(default)]
    pub cron: Option<String>,
}

/// Validated configuration with durations, tiers and patterns parsed.
///
/// Built only through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub options: ExecutionOptions,
    pub cascade_timeout: Option<Duration>,
    pub auto_fallback: bool,
    /// Steps in id order.
    pub steps: Vec<StepSpec>,
    /// Tiers declared under `[tier.<name>]`.
    pub tiers: Vec<TierSpec>,
    /// Exact routes first, then patterns; lookup order of the registry.
    pub routes: Vec<RouteSpec>,
    pub priorities: Vec<(Priority, CapabilityTier)>,
    pub triggers: Vec<Trigger>,
}

#[derive(Debug, Clone)]
pub struct StepSpec {
    pub name: String,
    pub cmd: String,
    pub after: Vec<String>,
    pub soft_after: Vec<String>,
    pub timeout: Option<Duration>,
    pub retry: Option<RetryConfig>,
    pub escalate: Vec<CapabilityTier>,
}

#[derive(Debug, Clone)]
pub struct TierSpec {
    pub tier: CapabilityTier,
    pub cmd: Option<String>,
    pub config: TierConfig,
}

#[derive(Debug, Clone)]
pub enum RouteSpec {
    Exact(String, CapabilityTier),
    Pattern(Regex, CapabilityTier),
}

impl ConfigFile {
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn tier(&self, tier: &CapabilityTier) -> Option<&TierSpec> {
        self.tiers.iter().find(|t| &t.tier == tier)
    }
}
