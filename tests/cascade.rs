// tests/cascade.rs

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use serde_json::json;

use tierflow::errors::CascadeError;
use tierflow::exec::{DurableStepRunner, ExecutionOptions, InMemoryStepRunner, LevelExecutor, StepStatus};
use tierflow::tier::{
    AuditAction, AuditEvent, AuditSink, CapabilityTier, CascadeExecutor, MemorySink, TierConfig,
    TierContext, TierHandler, TierRegistry,
};
use tierflow::{RetryConfig, StepConfig};
use tierflow_test_utils::fake_tiers::{RecordingTier, TierBehaviour};
use tierflow_test_utils::steps::{CallLog, value_step};
use tierflow_test_utils::{init_tracing, with_timeout};

#[tokio::test]
async fn first_tier_success_never_touches_later_tiers() {
    init_tracing();
    let code = RecordingTier::succeed(json!("cheap"));
    let generative = RecordingTier::succeed(json!("pricey"));
    let human = RecordingTier::succeed(json!("slow"));

    let cascade = CascadeExecutor::builder()
        .shared_handler(CapabilityTier::Code, code.handler())
        .shared_handler(CapabilityTier::Generative, generative.handler())
        .shared_handler(CapabilityTier::Human, human.handler())
        .build();

    let result = with_timeout(cascade.execute(json!({"task": "fix"}))).await.unwrap();

    assert_eq!(result.tier, CapabilityTier::Code);
    assert_eq!(result.value, json!("cheap"));
    assert_eq!(result.history.len(), 1);
    assert_eq!(code.calls(), 1);
    assert_eq!(generative.calls(), 0);
    assert_eq!(human.calls(), 0);
}

#[tokio::test]
async fn code_then_generative_escalation() {
    init_tracing();
    let code = RecordingTier::fail("lint rule 42 violated");
    let generative = RecordingTier::succeed(json!("patched"));

    let cascade = CascadeExecutor::builder()
        .shared_handler(CapabilityTier::Code, code.handler())
        .shared_handler(CapabilityTier::Generative, generative.handler())
        .build();

    let result = with_timeout(cascade.execute(json!(null))).await.unwrap();

    assert_eq!(result.tier, CapabilityTier::Generative);
    assert_eq!(result.value, json!("patched"));
    assert_eq!(result.history.len(), 2);
    assert!(!result.history[0].success);
    assert!(result.history[1].success);
    assert_eq!(
        result.skipped_tiers,
        vec![CapabilityTier::Agentic, CapabilityTier::Human]
    );

    let seen = generative.last_previous_errors();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].tier, CapabilityTier::Code);
    assert!(seen[0].message.contains("lint rule 42 violated"));
}

#[tokio::test]
async fn all_four_tiers_failing_keeps_full_history() {
    init_tracing();
    let tiers: Vec<RecordingTier> = (0..4)
        .map(|i| RecordingTier::fail(&format!("tier {i} gave up")))
        .collect();

    let mut builder = CascadeExecutor::builder();
    for (tier, fake) in CapabilityTier::BUILT_IN.into_iter().zip(&tiers) {
        builder = builder.shared_handler(tier, fake.handler());
    }
    let err = with_timeout(builder.build().execute(json!(null))).await.unwrap_err();

    let CascadeError::AllTiersFailed { history } = err else {
        panic!("expected AllTiersFailed, got {err:?}");
    };
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|r| !r.success));

    // The human tier sees every earlier failure, in order.
    let human_saw: Vec<CapabilityTier> = tiers[3]
        .last_previous_errors()
        .into_iter()
        .map(|e| e.tier)
        .collect();
    assert_eq!(
        human_saw,
        vec![
            CapabilityTier::Code,
            CapabilityTier::Generative,
            CapabilityTier::Agentic
        ]
    );
}

#[tokio::test]
async fn total_timeout_cancels_running_tier() {
    init_tracing();
    let code = RecordingTier::fail("nope");
    let human = RecordingTier::sleep(Duration::from_secs(10), json!("approved"));

    let cascade = CascadeExecutor::builder()
        .shared_handler(CapabilityTier::Code, code.handler())
        .shared_handler(CapabilityTier::Human, human.handler())
        .total_timeout(Duration::from_millis(50))
        .build();

    let started = Instant::now();
    let err = with_timeout(cascade.execute(json!(null))).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(2));
    match err {
        CascadeError::CascadeTimeout { limit, elapsed, history } => {
            assert_eq!(limit, Duration::from_millis(50));
            assert!(elapsed >= limit);
            assert_eq!(history.len(), 2);
            assert!(history[1].timed_out);
        }
        other => panic!("expected CascadeTimeout, got {other:?}"),
    }

    let ctx = &human.contexts()[0];
    assert!(ctx.cancel.is_cancelled());
}

#[tokio::test]
async fn total_timeout_wins_over_equal_tier_timeout() {
    let code = RecordingTier::sleep(Duration::from_secs(10), json!("late"));
    let generative = RecordingTier::succeed(json!("never reached"));

    let cascade = CascadeExecutor::builder()
        .shared_handler(CapabilityTier::Code, code.handler())
        .tier_timeout(CapabilityTier::Code, Duration::from_millis(40))
        .shared_handler(CapabilityTier::Generative, generative.handler())
        .total_timeout(Duration::from_millis(40))
        .build();

    let err = with_timeout(cascade.execute(json!(null))).await.unwrap_err();
    assert!(matches!(err, CascadeError::CascadeTimeout { .. }));
    assert_eq!(generative.calls(), 0);
}

#[tokio::test]
async fn tier_retries_back_off_before_escalating() {
    let code = RecordingTier::new(TierBehaviour::FailTimes(2, json!("third time lucky")));
    let cascade = CascadeExecutor::builder()
        .shared_handler(CapabilityTier::Code, code.handler())
        .tier_retry(
            CapabilityTier::Code,
            RetryConfig::with_max_retries(2).base_delay(Duration::from_millis(20)),
        )
        .build();

    let started = Instant::now();
    let result = with_timeout(cascade.execute(json!(null))).await.unwrap();

    // 20ms + 40ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(result.history[0].attempts, 3);
    let attempts: Vec<u32> = code.contexts().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[tokio::test]
async fn skip_condition_and_unavailable_tiers_are_skipped() {
    let registry = Arc::new(TierRegistry::with_builtin_tiers());
    registry.set_tier_availability(&CapabilityTier::Generative, false);

    let code = RecordingTier::succeed(json!("code"));
    let generative = RecordingTier::succeed(json!("generative"));
    let human = RecordingTier::succeed(json!("human"));

    let cascade = CascadeExecutor::builder()
        .shared_handler(CapabilityTier::Code, code.handler())
        .skip_when(CapabilityTier::Code, |input| input["needs_judgement"] == json!(true))
        .shared_handler(CapabilityTier::Generative, generative.handler())
        .shared_handler(CapabilityTier::Human, human.handler())
        .registry(registry)
        .build();

    let result = with_timeout(cascade.execute(json!({"needs_judgement": true})))
        .await
        .unwrap();

    assert_eq!(result.tier, CapabilityTier::Human);
    assert_eq!(
        result.skipped_tiers,
        vec![
            CapabilityTier::Code,
            CapabilityTier::Generative,
            CapabilityTier::Agentic
        ]
    );
    assert_eq!(code.calls() + generative.calls(), 0);
    assert_eq!(result.context.steps().len(), 4);
}

#[tokio::test]
async fn from_registry_uses_priority_order_and_records_metrics() {
    let registry = Arc::new(TierRegistry::new());
    registry.register_tier(
        CapabilityTier::Custom("lint-bot".into()),
        TierConfig::for_tier(&CapabilityTier::Code).priority(0),
    );
    registry.register_tier(
        CapabilityTier::Human,
        TierConfig::for_tier(&CapabilityTier::Human).priority(10),
    );

    let bot = RecordingTier::fail("bot confused");
    let human = RecordingTier::succeed(json!("done by hand"));
    let handlers: Vec<(CapabilityTier, Arc<dyn TierHandler>)> = vec![
        (CapabilityTier::Human, human.handler()),
        (CapabilityTier::Custom("lint-bot".into()), bot.handler()),
    ];

    let cascade = CascadeExecutor::from_registry(registry.clone(), handlers).build();
    assert_eq!(
        cascade.tiers(),
        vec![CapabilityTier::Custom("lint-bot".into()), CapabilityTier::Human]
    );

    let result = with_timeout(cascade.execute(json!(null))).await.unwrap();
    assert_eq!(result.tier, CapabilityTier::Human);

    let bot_metrics = registry.metrics(&CapabilityTier::Custom("lint-bot".into()));
    assert_eq!(bot_metrics.usage_count, 1);
    assert_eq!(bot_metrics.failure_count, 1);
    assert_eq!(registry.success_rate(&CapabilityTier::Human), Some(1.0));
}

#[tokio::test]
async fn from_registry_follows_explicit_fallback_chain() {
    let registry = Arc::new(TierRegistry::with_builtin_tiers());
    registry.set_fallback_chain(CapabilityTier::Code, vec![CapabilityTier::Human]);

    let code = RecordingTier::fail("lint failed");
    let generative = RecordingTier::succeed(json!("model fix"));
    let human = RecordingTier::succeed(json!("hand fix"));
    let handlers: Vec<(CapabilityTier, Arc<dyn TierHandler>)> = vec![
        (CapabilityTier::Code, code.handler()),
        (CapabilityTier::Generative, generative.handler()),
        (CapabilityTier::Human, human.handler()),
    ];

    let cascade = CascadeExecutor::from_registry(registry, handlers).build();
    assert_eq!(cascade.tiers(), vec![CapabilityTier::Code, CapabilityTier::Human]);

    let result = with_timeout(cascade.execute(json!(null))).await.unwrap();
    assert_eq!(result.tier, CapabilityTier::Human);
    assert_eq!(result.value, json!("hand fix"));
    assert_eq!(code.calls(), 1);
    assert_eq!(generative.calls(), 0);
}

#[tokio::test]
async fn concurrent_cascades_share_registry_metrics() {
    let registry = Arc::new(TierRegistry::with_builtin_tiers());
    let mut handles = Vec::new();

    for i in 0..16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let cascade = CascadeExecutor::builder()
                .code(move |_ctx: TierContext| async move {
                    if i % 2 == 0 { Ok(json!(i)) } else { Err(anyhow!("odd")) }
                })
                .generative(|_ctx: TierContext| async { Ok(json!("rescued")) })
                .registry(registry)
                .build();
            cascade.execute(json!(null)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let code = registry.metrics(&CapabilityTier::Code);
    assert_eq!(code.usage_count, 16);
    assert_eq!(code.success_count, 8);
    assert_eq!(code.failure_count, 8);
    assert_eq!(registry.metrics(&CapabilityTier::Generative).usage_count, 8);
}

struct BrokenSink;

impl AuditSink for BrokenSink {
    fn on_event(&self, _event: &AuditEvent) -> anyhow::Result<()> {
        Err(anyhow!("disk full"))
    }
}

#[tokio::test]
async fn failing_sink_does_not_abort_cascade() {
    let cascade = CascadeExecutor::builder()
        .code(|_ctx: TierContext| async { Ok(json!("fine")) })
        .event_sink(Arc::new(BrokenSink))
        .build();

    let result = with_timeout(cascade.execute(json!(null))).await.unwrap();
    assert_eq!(result.value, json!("fine"));
}

#[tokio::test]
async fn escalation_events_carry_the_reason() {
    let sink = Arc::new(MemorySink::new());
    let cascade = CascadeExecutor::builder()
        .code(|_ctx: TierContext| async { Err(anyhow!("schema mismatch")) })
        .agentic(|_ctx: TierContext| async { Ok(json!("migrated")) })
        .event_sink(sink.clone())
        .actor("billing-sync")
        .build();

    let result = with_timeout(cascade.execute(json!(null))).await.unwrap();

    let events = sink.events();
    let escalation = events
        .iter()
        .find(|e| e.what == AuditAction::Escalated)
        .expect("escalation event");
    assert_eq!(escalation.who, "billing-sync");
    assert_eq!(escalation.location, "cascade/agentic");
    assert!(escalation.why.as_deref().unwrap_or("").contains("schema mismatch"));
    assert!(events.iter().all(|e| e.correlation_id == result.context.correlation_id));
    assert_eq!(events.last().map(|e| e.what), Some(AuditAction::CascadeSucceeded));
}

#[tokio::test]
async fn failed_cascade_step_blocks_hard_dependents() {
    init_tracing();
    let cascade = CascadeExecutor::builder()
        .code(|_ctx: TierContext| async { Err(anyhow!("no luck")) })
        .human(|ctx: TierContext| async move {
            Err(anyhow!("rejected after {} earlier failure(s)", ctx.previous_errors.len()))
        })
        .build();

    let log = CallLog::new();
    let steps = vec![
        Arc::new(cascade).into_step("repair", StepConfig::default()),
        value_step("deploy", json!("shipped"), &log).after("repair"),
    ];

    let runner: Arc<dyn DurableStepRunner> = Arc::new(InMemoryStepRunner::new());
    let options = ExecutionOptions {
        continue_on_error: true,
        ..ExecutionOptions::default()
    };
    let result = with_timeout(LevelExecutor::new(runner, options).run_steps(steps, json!(null)))
        .await
        .unwrap();

    assert_eq!(result.status_of("repair"), StepStatus::Failed);
    assert_eq!(result.status_of("deploy"), StepStatus::Skipped);
    assert_eq!(log.count("deploy"), 0);
    assert!(format!("{}", result.failed_steps["repair"]).contains("all 2 attempted tier(s) failed"));
}

#[tokio::test]
async fn cascade_step_sees_earlier_results() {
    let cascade = CascadeExecutor::builder()
        .code(|ctx: TierContext| async move {
            let upstream = ctx.input["results"]["fetch"].clone();
            Ok(json!({ "repaired": upstream }))
        })
        .build();

    let log = CallLog::new();
    let steps = vec![
        value_step("fetch", json!("payload"), &log),
        Arc::new(cascade)
            .into_step("repair", StepConfig::default())
            .after("fetch"),
    ];

    let runner: Arc<dyn DurableStepRunner> = Arc::new(InMemoryStepRunner::new());
    let result = with_timeout(
        LevelExecutor::new(runner, ExecutionOptions::default()).run_steps(steps, json!(null)),
    )
    .await
    .unwrap();

    assert_eq!(result.results["repair"], json!({ "repaired": "payload" }));
}
