// src/config/assemble.rs

//! Build runtime objects from a validated [`ConfigFile`].

use std::sync::Arc;

use tracing::debug;

use crate::config::model::{ConfigFile, RouteSpec, StepSpec};
use crate::errors::StructuralError;
use crate::exec::command::{ShellTierHandler, shell_step};
use crate::exec::level::ExecutionOptions;
use crate::tier::audit::AuditSink;
use crate::tier::cascade::CascadeBuilder;
use crate::tier::registry::{FailurePattern, TierRegistry};
use crate::tier::types::CapabilityTier;
use crate::workflow::{Step, StepConfig, Workflow};

/// Everything needed to run a workflow file.
#[derive(Debug)]
pub struct Assembled {
    pub workflow: Workflow,
    pub registry: Arc<TierRegistry>,
    pub options: ExecutionOptions,
}

/// Registry with the built-in tiers, overridden/extended by `[tier.*]`,
/// plus routes, priorities and fallback settings.
pub fn build_registry(cfg: &ConfigFile) -> TierRegistry {
    let registry = TierRegistry::with_builtin_tiers();

    for spec in &cfg.tiers {
        registry.register_tier(spec.tier.clone(), spec.config.clone());
    }

    for route in &cfg.routes {
        match route {
            RouteSpec::Exact(failure, tier) => {
                registry.map_failure_to_tier(failure.as_str(), tier.clone());
            }
            RouteSpec::Pattern(re, tier) => {
                registry.map_failure_to_tier(FailurePattern::Regex(re.clone()), tier.clone());
            }
        }
    }

    for (priority, tier) in &cfg.priorities {
        registry.set_priority_tier(*priority, tier.clone());
    }

    if cfg.auto_fallback {
        registry.enable_auto_fallback();
    }

    registry
}

/// Build the workflow and registry described by `cfg`.
///
/// Plain steps run their `cmd`; steps with `escalate` run a cascade whose
/// code tier is the step's own `cmd`.
pub fn assemble(cfg: &ConfigFile, sink: Arc<dyn AuditSink>) -> Result<Assembled, StructuralError> {
    let registry = Arc::new(build_registry(cfg));

    let mut builder = Workflow::builder("tierflow");
    for spec in &cfg.steps {
        let step = build_step(cfg, spec, &registry, &sink);
        builder = builder.step(step);
    }
    for trigger in &cfg.triggers {
        builder = builder.trigger(trigger.clone());
    }

    let workflow = builder.build()?;

    Ok(Assembled {
        workflow,
        registry,
        options: cfg.options.clone(),
    })
}

fn build_step(
    cfg: &ConfigFile,
    spec: &StepSpec,
    registry: &Arc<TierRegistry>,
    sink: &Arc<dyn AuditSink>,
) -> Step {
    let config = StepConfig {
        retry: spec.retry.clone(),
        timeout: spec.timeout,
    };

    let step = if spec.escalate.is_empty() {
        shell_step(spec.name.clone(), spec.cmd.clone(), config)
    } else {
        let order = std::iter::once(CapabilityTier::Code).chain(spec.escalate.iter().cloned());
        let mut cascade = CascadeBuilder::with_order(order)
            .handler(
                CapabilityTier::Code,
                ShellTierHandler::new(spec.name.clone(), spec.cmd.clone()),
            )
            .registry(registry.clone())
            .event_sink(sink.clone())
            .actor(format!("tierflow/{}", spec.name));

        for tier in &spec.escalate {
            if let Some(cmd) = cfg.tier(tier).and_then(|t| t.cmd.clone()) {
                cascade = cascade.handler(tier.clone(), ShellTierHandler::new(spec.name.clone(), cmd));
            }
        }

        // Code tier limits come from [tier.code] when present.
        for tier in std::iter::once(&CapabilityTier::Code).chain(spec.escalate.iter()) {
            if let Some(tier_cfg) = registry.tier_config(tier) {
                if let Some(timeout) = tier_cfg.timeout {
                    cascade = cascade.tier_timeout(tier.clone(), timeout);
                }
                cascade = cascade.tier_retry(tier.clone(), tier_cfg.retry);
            }
        }

        if let Some(limit) = cfg.cascade_timeout {
            cascade = cascade.total_timeout(limit);
        }

        debug!(step = %spec.name, tiers = ?spec.escalate, "step escalates through cascade");
        Arc::new(cascade.build()).into_step(spec.name.clone(), config)
    };

    let step = spec.after.iter().fold(step, |s, dep| s.after(dep.clone()));
    spec.soft_after
        .iter()
        .fold(step, |s, dep| s.after_soft(dep.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::RawConfigFile;
    use crate::tier::audit::MemorySink;
    use crate::tier::types::Priority;
    use crate::types::DependencyKind;

    fn config(src: &str) -> ConfigFile {
        let raw: RawConfigFile = toml::from_str(src).unwrap();
        ConfigFile::try_from(raw).unwrap()
    }

    #[test]
    fn registry_reflects_config() {
        let cfg = config(
            r#"
            [config]
            auto_fallback = true

            [step.a]
            cmd = "true"

            [tier.agentic]
            available = false

            [routing]
            exact = { "auth" = "code" }
            patterns = [ { pattern = "^auth", tier = "human" } ]

            [priority]
            normal = "agentic"
            "#,
        );
        let reg = build_registry(&cfg);

        assert!(!reg.is_tier_available(&CapabilityTier::Agentic));
        assert_eq!(reg.route_to_tier("auth"), Some(CapabilityTier::Code));
        assert_eq!(reg.route_to_tier("auth_expired"), Some(CapabilityTier::Human));
        assert_eq!(reg.get_tier_for_priority(Priority::Normal), CapabilityTier::Agentic);
        assert_eq!(
            reg.get_next_available_fallback(&CapabilityTier::Generative),
            Some(CapabilityTier::Human)
        );
    }

    #[test]
    fn workflow_carries_dependencies_and_triggers() {
        let cfg = config(
            r#"
            [step.fetch]
            cmd = "echo fetch"
            [step.lint]
            cmd = "echo lint"
            [step.build]
            cmd = "make"
            after = ["fetch"]
            soft_after = ["lint"]
            escalate = ["human"]

            [tier.human]
            cmd = "page-oncall"

            [[trigger]]
            event = "push"
            "#,
        );
        let assembled = assemble(&cfg, Arc::new(MemorySink::new())).unwrap();
        let graph = assembled.workflow.graph();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.dependency_kind("build", "fetch"), Some(DependencyKind::Hard));
        assert_eq!(graph.dependency_kind("build", "lint"), Some(DependencyKind::Soft));
        assert_eq!(assembled.workflow.triggers().len(), 1);
        assert_eq!(assembled.workflow.levels().unwrap().len(), 2);
    }
}
