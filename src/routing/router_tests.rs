//! Tests for the hybrid router.

use super::*;
use crate::agents::{
    ActivationConfig, AgentDescriptor, AgentGraph, AgentId, AgentRegistry, AgentState,
    SimulatedLauncher,
};
use crate::memory::VramLedger;
use crate::models::{
    BackendKind, LoaderConfig, ModelDescriptor, ModelId, ModelRegistry, SimulatedBackend,
    SimulatedBackendConfig,
};
use crate::routing::breaker::BreakerConfig;
use crate::routing::rules::{PayloadBoost, RoutingRuleConfig};
use rand::Rng;

fn rule(name: &str, pattern: &str, complexity: f64) -> RoutingRuleConfig {
    RoutingRuleConfig {
        name: name.into(),
        pattern: pattern.into(),
        complexity,
        preferred_backend: None,
        failover_backend: None,
        agent: None,
    }
}

fn loader(gpu: SimulatedBackendConfig) -> ModelLoader {
    let backends = BackendSet::new()
        .with(Arc::new(SimulatedBackend::with_config("gpu0", BackendKind::LocalGpu, gpu)))
        .with(Arc::new(SimulatedBackend::new("cloud", BackendKind::Remote)));
    let registry = ModelRegistry::from_catalog([
        ModelDescriptor::new("whisper", "", 1_000, BackendKind::LocalGpu),
        ModelDescriptor::new("llama", "", 4_000, BackendKind::LocalGpu),
    ])
    .unwrap();
    ModelLoader::new(
        Arc::new(registry),
        Arc::new(VramLedger::new(8_000, 0).unwrap()),
        backends,
        LoaderConfig::default(),
    )
}

fn router_with(extra: Vec<RoutingRuleConfig>, gpu: SimulatedBackendConfig) -> HybridRouter {
    let mut table = vec![
        rule("reasoning", "^(reason|plan|code)", 0.9),
        rule("speech", "^asr", 0.2),
    ];
    table.extend(extra);
    let rules = RuleSet::compile(&table, 0.4, PayloadBoost::default()).unwrap();
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: 3,
        ..Default::default()
    }));
    let config = RouterConfig {
        local_backend: "gpu0".into(),
        heavy_backend: "cloud".into(),
        ..Default::default()
    };
    HybridRouter::new(rules, breakers, loader(gpu), config)
}

fn router() -> HybridRouter {
    router_with(Vec::new(), SimulatedBackendConfig::default())
}

fn trip(router: &HybridRouter, backend: &str) {
    for _ in 0..3 {
        router.record_outcome(backend, Outcome::Failure);
    }
}

#[tokio::test]
async fn test_heavy_tasks_reach_heavy_backend() {
    let router = router();
    let types = ["reason.math", "plan.trip", "code.review"];
    let mut rng = rand::thread_rng();

    let total = 200;
    let mut heavy_hits = 0;
    for i in 0..total {
        let task_type = types[rng.gen_range(0..types.len())];
        let task = TaskRequest::new(&format!("h{}", i), task_type, 1_000)
            .with_payload_bytes(rng.gen_range(0..8 * 1024 * 1024));
        let decision = router.route(&task).await.unwrap();
        if decision.backend_id == "cloud" && decision.decision == Decision::Remote {
            heavy_hits += 1;
        }
    }
    assert!(heavy_hits * 100 >= total * 95, "{} of {}", heavy_hits, total);
}

#[tokio::test]
async fn test_light_task_loads_required_model_locally() {
    let router = router();
    let task = TaskRequest::new("t1", "asr.transcribe", 5_000).with_model("whisper");

    let decision = router.route(&task).await.unwrap();

    assert_eq!(decision.decision, Decision::Local);
    assert_eq!(decision.backend_id, "gpu0");
    assert!(decision.model_handle.is_some());
    assert_eq!(decision.rule.as_deref(), Some("speech"));
}

#[tokio::test]
async fn test_large_payload_tips_task_to_heavy() {
    let router = router();
    let small = TaskRequest::new("s", "summarize", 1_000);
    let large = TaskRequest::new("l", "summarize", 1_000).with_payload_bytes(64 * 1024 * 1024);

    assert_eq!(router.route(&small).await.unwrap().backend_id, "gpu0");
    // 0.4 + 0.2 stays below 0.8.
    assert_eq!(router.route(&large).await.unwrap().backend_id, "gpu0");

    let router = router_with(vec![rule("summary", "^summarize", 0.7)], Default::default());
    let large = TaskRequest::new("l2", "summarize", 1_000).with_payload_bytes(64 * 1024 * 1024);
    assert_eq!(router.route(&large).await.unwrap().backend_id, "cloud");
}

#[tokio::test]
async fn test_open_breaker_fails_over_and_flags_degraded() {
    let router = router();
    trip(&router, "cloud");

    let decision = router
        .route(&TaskRequest::new("t1", "reason.proof", 1_000))
        .await
        .unwrap();

    assert_eq!(decision.decision, Decision::Degraded);
    assert_eq!(decision.backend_id, "gpu0");
}

#[tokio::test]
async fn test_rule_failover_backend_preferred() {
    let mut custom = rule("vision", "^vision", 0.95);
    custom.preferred_backend = Some("gpu0".into());
    custom.failover_backend = Some("cloud".into());
    let router = router_with(vec![custom], Default::default());
    trip(&router, "gpu0");

    let decision = router
        .route(&TaskRequest::new("v", "vision.scene", 1_000))
        .await
        .unwrap();
    assert_eq!(decision.backend_id, "cloud");
    assert_eq!(decision.decision, Decision::Degraded);
}

#[tokio::test]
async fn test_both_backends_tripped_is_unavailable() {
    let router = router();
    trip(&router, "cloud");
    trip(&router, "gpu0");

    let err = router
        .route(&TaskRequest::new("t1", "reason", 1_000))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RouteError::BackendUnavailable {
            backend: "cloud".into()
        }
    );
}

#[tokio::test]
async fn test_decisions_replayed_for_retries() {
    let router = router();
    let task = TaskRequest::new("retry-me", "reason", 1_000);

    let first = router.route(&task).await.unwrap();
    trip(&router, "cloud");
    let second = router.route(&task).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(router.decision_count(), 1);
    assert_eq!(router.purge_decisions(Instant::now() + Duration::from_secs(301)), 1);
}

#[tokio::test]
async fn test_replay_reloads_evicted_model() {
    let router = router();
    let task = TaskRequest::new("t-replay", "asr.transcribe", 5_000).with_model("whisper");
    let whisper = ModelId::from("whisper");

    let first = router.route(&task).await.unwrap();
    router.loader.unload(&whisper).await.unwrap();

    let replayed = router.route(&task).await.unwrap();

    let current = router.loader.registry().get(&whisper).unwrap();
    assert_eq!(current.state, ModelState::Resident);
    assert_eq!(replayed.model_handle, current.handle);
    assert_ne!(replayed.model_handle, first.model_handle);
    assert_eq!(replayed.backend_id, first.backend_id);

    // The refreshed handle is what later retries see.
    let again = router.route(&task).await.unwrap();
    assert_eq!(again.model_handle, replayed.model_handle);
}

#[tokio::test]
async fn test_failed_model_load_feeds_breaker() {
    let router = router_with(
        Vec::new(),
        SimulatedBackendConfig {
            load_failure_rate: 1.0,
            ..Default::default()
        },
    );
    let task = TaskRequest::new("t1", "asr", 1_000).with_model("whisper");

    let err = router.route(&task).await.unwrap_err();
    assert!(matches!(err, RouteError::Load(LoadError::LoadFailed { .. })));
    assert_eq!(router.breakers().snapshot()[0].failure_count, 1);
}

#[tokio::test]
async fn test_agent_bound_rule_activates_agent_first() {
    let mut bound = rule("tutor", "^tutor", 0.5);
    bound.agent = Some("tutor-agent".into());

    let agents = vec![
        AgentDescriptor::new("tutor-agent").depends_on(&["context"]),
        AgentDescriptor::new("context"),
    ];
    let graph = Arc::new(AgentGraph::new(&agents).unwrap());
    let registry = Arc::new(AgentRegistry::from_catalog(agents).unwrap());
    let launcher = Arc::new(SimulatedLauncher::new(
        registry.clone(),
        Duration::from_millis(5),
        Duration::from_millis(5),
    ));
    let lazy = LazyAgentLoader::new(registry.clone(), graph, launcher, ActivationConfig::default());
    let router = router_with(vec![bound], Default::default()).with_agents(lazy);

    let decision = router
        .route(&TaskRequest::new("t1", "tutor.explain", 5_000))
        .await
        .unwrap();

    assert_eq!(decision.agent, Some(AgentId::from("tutor-agent")));
    assert_eq!(
        registry.state(&AgentId::from("tutor-agent")),
        Some(AgentState::Running)
    );
    assert_eq!(registry.state(&AgentId::from("context")), Some(AgentState::Running));
}
