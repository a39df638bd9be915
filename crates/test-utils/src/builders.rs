#![allow(dead_code)]

use tierflow::config::model::{PatternRoute, StepSection, TierSection};
use tierflow::config::{ConfigFile, RawConfigFile};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_step(mut self, name: &str, step: StepSection) -> Self {
        self.config.step.insert(name.to_string(), step);
        self
    }

    pub fn with_tier(mut self, name: &str, tier: TierSection) -> Self {
        self.config.tier.insert(name.to_string(), tier);
        self
    }

    pub fn continue_on_error(mut self, val: bool) -> Self {
        self.config.config.continue_on_error = val;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.config.config.max_concurrency = Some(n);
        self
    }

    pub fn auto_fallback(mut self, val: bool) -> Self {
        self.config.config.auto_fallback = val;
        self
    }

    pub fn route_exact(mut self, failure: &str, tier: &str) -> Self {
        self.config
            .routing
            .exact
            .insert(failure.to_string(), tier.to_string());
        self
    }

    pub fn route_pattern(mut self, pattern: &str, tier: &str) -> Self {
        self.config.routing.patterns.push(PatternRoute {
            pattern: pattern.to_string(),
            tier: tier.to_string(),
        });
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `StepSection`.
pub struct StepSectionBuilder {
    step: StepSection,
}

impl StepSectionBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            step: StepSection {
                cmd: cmd.to_string(),
                after: vec![],
                soft_after: vec![],
                timeout: None,
                retries: None,
                escalate: vec![],
            },
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.step.after.push(dep.to_string());
        self
    }

    pub fn soft_after(mut self, dep: &str) -> Self {
        self.step.soft_after.push(dep.to_string());
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.step.timeout = Some(duration.to_string());
        self
    }

    pub fn retries(mut self, n: u32) -> Self {
        self.step.retries = Some(n);
        self
    }

    pub fn escalate(mut self, tier: &str) -> Self {
        self.step.escalate.push(tier.to_string());
        self
    }

    pub fn build(self) -> StepSection {
        self.step
    }
}

/// Builder for `TierSection`.
pub struct TierSectionBuilder {
    tier: TierSection,
}

impl TierSectionBuilder {
    pub fn new() -> Self {
        Self {
            tier: TierSection {
                cmd: None,
                priority: None,
                timeout: None,
                max_retries: 0,
                base_delay: None,
                available: true,
            },
        }
    }

    pub fn cmd(mut self, cmd: &str) -> Self {
        self.tier.cmd = Some(cmd.to_string());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.tier.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, duration: &str) -> Self {
        self.tier.timeout = Some(duration.to_string());
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.tier.max_retries = n;
        self
    }

    pub fn available(mut self, val: bool) -> Self {
        self.tier.available = val;
        self
    }

    pub fn build(self) -> TierSection {
        self.tier
    }
}

impl Default for TierSectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
