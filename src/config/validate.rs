// src/config/validate.rs

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;

use crate::config::model::{
    ConfigFile, RawConfigFile, RetrySection, RouteSpec, StepSection, StepSpec, TierSpec,
    TriggerSection,
};
use crate::dag::DependencyGraph;
use crate::errors::{Result, TierflowError};
use crate::exec::level::ExecutionOptions;
use crate::exec::retry::RetryConfig;
use crate::tier::types::{CapabilityTier, Priority, TierConfig};
use crate::types::{DependencyKind, parse_duration};
use crate::workflow::Trigger;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = TierflowError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        ensure_has_steps(&raw)?;
        validate_global_config(&raw)?;
        validate_graph(&raw)?;

        let default_retry = parse_retry_section(&raw.retry)?;
        let default_timeout = opt_duration("[config].step_timeout", raw.config.step_timeout.as_deref())?;
        let cascade_timeout =
            opt_duration("[config].cascade_timeout", raw.config.cascade_timeout.as_deref())?;
        let run_timeout = opt_duration("[config].run_timeout", raw.config.run_timeout.as_deref())?;

        let tiers = parse_tiers(&raw)?;
        let known = known_tiers(&tiers);

        let mut steps = Vec::with_capacity(raw.step.len());
        for (name, section) in &raw.step {
            steps.push(parse_step(name, section, &default_retry, &tiers)?);
        }

        let routes = parse_routes(&raw, &known)?;
        let priorities = parse_priorities(&raw, &known)?;
        let triggers = raw
            .trigger
            .iter()
            .enumerate()
            .map(|(i, t)| parse_trigger(i, t))
            .collect::<Result<Vec<_>>>()?;

        Ok(ConfigFile {
            options: ExecutionOptions {
                continue_on_error: raw.config.continue_on_error,
                max_concurrency: raw.config.max_concurrency,
                default_timeout,
                default_retry,
                run_timeout,
            },
            cascade_timeout,
            auto_fallback: raw.config.auto_fallback,
            steps,
            tiers,
            routes,
            priorities,
            triggers,
        })
    }
}

fn config_err(msg: impl Into<String>) -> TierflowError {
    TierflowError::ConfigError(msg.into())
}

fn ensure_has_steps(cfg: &RawConfigFile) -> Result<()> {
    if cfg.step.is_empty() {
        return Err(config_err(
            "config must contain at least one [step.<name>] section",
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawConfigFile) -> Result<()> {
    if cfg.config.max_concurrency == Some(0) {
        return Err(config_err("[config].max_concurrency must be >= 1 (got 0)"));
    }
    if cfg.retry.limit == 0 {
        return Err(config_err("[retry].limit must be >= 1 (got 0)"));
    }
    if !(cfg.retry.multiplier.is_finite() && cfg.retry.multiplier > 0.0) {
        return Err(config_err(format!(
            "[retry].multiplier must be a positive number (got {})",
            cfg.retry.multiplier
        )));
    }
    Ok(())
}

/// Duplicate ids cannot occur (TOML table keys), so only unknown
/// dependencies and cycles are left to report.
fn validate_graph(cfg: &RawConfigFile) -> Result<()> {
    let mut graph = DependencyGraph::new();
    for (name, step) in &cfg.step {
        let edges = step
            .after
            .iter()
            .map(|d| (d.clone(), DependencyKind::Hard))
            .chain(step.soft_after.iter().map(|d| (d.clone(), DependencyKind::Soft)))
            .collect();
        graph.add_node_with_edges(name.clone(), edges)?;
    }

    if let Some(first) = graph.validate().into_iter().next() {
        return Err(TierflowError::Structural(first));
    }
    Ok(())
}

fn opt_duration(field: &str, value: Option<&str>) -> Result<Option<Duration>> {
    value
        .map(|s| parse_duration(s).map_err(|e| config_err(format!("{field}: {e}"))))
        .transpose()
}

fn parse_retry_section(section: &RetrySection) -> Result<RetryConfig> {
    let base_delay = parse_duration(&section.base_delay)
        .map_err(|e| config_err(format!("[retry].base_delay: {e}")))?;
    let mut retry = RetryConfig::with_limit(section.limit)
        .base_delay(base_delay)
        .multiplier(section.multiplier);
    if let Some(cap) = opt_duration("[retry].max_delay", section.max_delay.as_deref())? {
        retry = retry.max_delay(cap);
    }
    Ok(retry)
}

fn parse_tiers(cfg: &RawConfigFile) -> Result<Vec<TierSpec>> {
    let mut tiers = Vec::with_capacity(cfg.tier.len());
    for (name, section) in &cfg.tier {
        let tier = CapabilityTier::from(name.as_str());
        let mut config = TierConfig::for_tier(&tier).available(section.available);

        if let Some(priority) = section.priority {
            config = config.priority(priority);
        }
        if let Some(timeout) =
            opt_duration(&format!("[tier.{name}].timeout"), section.timeout.as_deref())?
        {
            config = config.timeout(timeout);
        }

        let mut retry = RetryConfig::with_max_retries(section.max_retries);
        if let Some(delay) =
            opt_duration(&format!("[tier.{name}].base_delay"), section.base_delay.as_deref())?
        {
            retry = retry.base_delay(delay);
        }
        config = config.retry(retry);

        tiers.push(TierSpec {
            tier,
            cmd: section.cmd.clone(),
            config,
        });
    }
    Ok(tiers)
}

/// Built-in tiers plus everything declared under `[tier.<name>]`.
fn known_tiers(tiers: &[TierSpec]) -> BTreeSet<CapabilityTier> {
    CapabilityTier::BUILT_IN
        .into_iter()
        .chain(tiers.iter().map(|t| t.tier.clone()))
        .collect()
}

fn parse_step(
    name: &str,
    section: &StepSection,
    default_retry: &RetryConfig,
    tiers: &[TierSpec],
) -> Result<StepSpec> {
    if section.cmd.trim().is_empty() {
        return Err(config_err(format!("step '{name}' has an empty `cmd`")));
    }

    let timeout = opt_duration(&format!("[step.{name}].timeout"), section.timeout.as_deref())?;
    let retry = section.retries.map(|n| RetryConfig {
        max_attempts: n.saturating_add(1),
        ..default_retry.clone()
    });

    let mut escalate = Vec::with_capacity(section.escalate.len());
    for tier_name in &section.escalate {
        let tier = CapabilityTier::from(tier_name.as_str());
        if tier == CapabilityTier::Code {
            return Err(config_err(format!(
                "step '{name}' cannot escalate to 'code': its own `cmd` is the code tier"
            )));
        }
        let has_cmd = tiers
            .iter()
            .any(|t| t.tier == tier && t.cmd.as_deref().is_some_and(|c| !c.trim().is_empty()));
        if !has_cmd {
            return Err(config_err(format!(
                "step '{name}' escalates to tier '{tier}', which needs a [tier.{tier}] section with a `cmd`"
            )));
        }
        if escalate.contains(&tier) {
            return Err(config_err(format!(
                "step '{name}' lists tier '{tier}' more than once in `escalate`"
            )));
        }
        escalate.push(tier);
    }

    Ok(StepSpec {
        name: name.to_string(),
        cmd: section.cmd.clone(),
        after: section.after.clone(),
        soft_after: section.soft_after.clone(),
        timeout,
        retry,
        escalate,
    })
}

fn known_tier(name: &str, field: &str, known: &BTreeSet<CapabilityTier>) -> Result<CapabilityTier> {
    let tier = CapabilityTier::from(name);
    if !known.contains(&tier) {
        return Err(config_err(format!("{field}: unknown tier '{name}'")));
    }
    Ok(tier)
}

fn parse_routes(cfg: &RawConfigFile, known: &BTreeSet<CapabilityTier>) -> Result<Vec<RouteSpec>> {
    let mut routes = Vec::new();
    for (failure, tier) in &cfg.routing.exact {
        let tier = known_tier(tier, &format!("[routing].exact.{failure}"), known)?;
        routes.push(RouteSpec::Exact(failure.clone(), tier));
    }
    for route in &cfg.routing.patterns {
        let re = Regex::new(&route.pattern).map_err(|e| {
            config_err(format!(
                "[routing].patterns: invalid regex '{}': {e}",
                route.pattern
            ))
        })?;
        let tier = known_tier(&route.tier, "[routing].patterns", known)?;
        routes.push(RouteSpec::Pattern(re, tier));
    }
    Ok(routes)
}

fn parse_priorities(
    cfg: &RawConfigFile,
    known: &BTreeSet<CapabilityTier>,
) -> Result<Vec<(Priority, CapabilityTier)>> {
    cfg.priority
        .iter()
        .map(|(priority, tier)| {
            let priority: Priority = priority
                .parse()
                .map_err(|e: String| config_err(format!("[priority]: {e}")))?;
            let tier = known_tier(tier, &format!("[priority].{priority}"), known)?;
            Ok((priority, tier))
        })
        .collect()
}

fn parse_trigger(index: usize, t: &TriggerSection) -> Result<Trigger> {
    match (&t.event, &t.cron) {
        (Some(name), None) => Ok(Trigger::Event { name: name.clone() }),
        (None, Some(cron)) => Ok(Trigger::Schedule { cron: cron.clone() }),
        _ => Err(config_err(format!(
            "[[trigger]] #{index} must set exactly one of `event` or `cron`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StructuralError;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    #[test]
    fn rejects_empty_config() {
        let err = parse("").unwrap_err();
        assert!(matches!(err, TierflowError::ConfigError(_)));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = parse(
            r#"
            [step.a]
            cmd = "true"
            after = ["ghost"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TierflowError::Structural(StructuralError::MissingDependency { .. })
        ));
    }

    #[test]
    fn rejects_soft_cycle() {
        let err = parse(
            r#"
            [step.a]
            cmd = "true"
            soft_after = ["b"]
            [step.b]
            cmd = "true"
            after = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TierflowError::Structural(StructuralError::CircularDependency { .. })
        ));
    }

    #[test]
    fn escalation_requires_tier_command() {
        let err = parse(
            r#"
            [step.a]
            cmd = "true"
            escalate = ["human"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("[tier.human]"));
    }

    #[test]
    fn bad_regex_and_unknown_tier_are_reported() {
        let bad_regex = parse(
            r#"
            [step.a]
            cmd = "true"
            [routing]
            patterns = [ { pattern = "(", tier = "human" } ]
            "#,
        )
        .unwrap_err();
        assert!(bad_regex.to_string().contains("invalid regex"));

        let unknown = parse(
            r#"
            [step.a]
            cmd = "true"
            [priority]
            high = "oracle"
            "#,
        )
        .unwrap_err();
        assert!(unknown.to_string().contains("unknown tier 'oracle'"));
    }

    #[test]
    fn parses_full_config() {
        let cfg = parse(
            r#"
            [config]
            max_concurrency = 2
            step_timeout = "30s"
            cascade_timeout = "5m"

            [retry]
            limit = 2
            base_delay = "10ms"

            [step.fetch]
            cmd = "echo fetch"

            [step.build]
            cmd = "make"
            after = ["fetch"]
            retries = 3
            escalate = ["oracle"]

            [tier.oracle]
            cmd = "ask-oracle"
            priority = 5
            timeout = "1s"
            max_retries = 1

            [routing]
            exact = { "timeout" = "code" }
            patterns = [ { pattern = "^auth", tier = "oracle" } ]

            [priority]
            critical = "oracle"

            [[trigger]]
            event = "push"
            [[trigger]]
            cron = "0 * * * *"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.options.max_concurrency, Some(2));
        assert_eq!(cfg.options.default_timeout, Some(Duration::from_secs(30)));
        assert_eq!(cfg.options.default_retry.attempts(), 2);
        assert_eq!(cfg.cascade_timeout, Some(Duration::from_secs(300)));

        let build = cfg.step("build").unwrap();
        assert_eq!(build.retry.as_ref().unwrap().attempts(), 4);
        assert_eq!(build.retry.as_ref().unwrap().base_delay, Duration::from_millis(10));
        assert_eq!(build.escalate, vec![CapabilityTier::Custom("oracle".into())]);

        let oracle = cfg.tier(&CapabilityTier::Custom("oracle".into())).unwrap();
        assert_eq!(oracle.config.priority, 5);
        assert_eq!(oracle.config.retry.attempts(), 2);

        assert_eq!(cfg.routes.len(), 2);
        assert!(matches!(cfg.routes[0], RouteSpec::Exact(..)));
        assert_eq!(cfg.priorities.len(), 1);
        assert_eq!(cfg.triggers.len(), 2);
    }
}
