//! Tests for agent supervision and restart policy.

use std::sync::Arc;

use super::*;
use crate::agents::graph::AgentGraph;
use crate::agents::launcher::SimulatedLauncher;
use crate::agents::lazy_loader::ActivationConfig;
use crate::agents::registry::AgentRegistry;

const BEAT: Duration = Duration::from_millis(5);
const WAIT: Duration = Duration::from_secs(5);

fn setup(policy: RestartPolicy) -> (Supervisor, SupervisorHandle, Arc<SimulatedLauncher>) {
    let agents = vec![AgentDescriptor::new("asr").with_startup_deadline(Duration::from_secs(1))];
    let graph = Arc::new(AgentGraph::new(&agents).unwrap());
    let registry = Arc::new(AgentRegistry::from_catalog(agents).unwrap());
    let launcher = Arc::new(SimulatedLauncher::new(registry.clone(), Duration::ZERO, BEAT));
    let loader = LazyAgentLoader::new(registry, graph, launcher.clone(), ActivationConfig::default());
    let config = SupervisorConfig {
        heartbeat_interval: Duration::from_millis(500),
        poll_interval: Duration::from_millis(5),
        policy,
    };
    let (supervisor, handle) = Supervisor::new(loader, config);
    (supervisor, handle, launcher)
}

fn asr() -> AgentId {
    AgentId::from("asr")
}

async fn start(supervisor: &Supervisor) {
    supervisor
        .loader
        .ensure(&asr(), tokio::time::Instant::now() + WAIT)
        .await
        .unwrap();
}

async fn wait_for_state(supervisor: &Supervisor, state: AgentState) {
    let mut rx = supervisor.loader.registry().subscribe(&asr()).unwrap();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap()
        .unwrap();
}

#[test]
fn test_restart_delay_doubles_then_caps() {
    let policy = RestartPolicy {
        base_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(3),
        max_restarts: 5,
        jitter: 0.0,
        ..Default::default()
    };
    assert_eq!(policy.delay_for(1, 0.0), Some(Duration::from_secs(1)));
    assert_eq!(policy.delay_for(2, 0.0), Some(Duration::from_secs(2)));
    assert_eq!(policy.delay_for(3, 0.0), Some(Duration::from_secs(3)));
    assert_eq!(policy.delay_for(5, 0.0), Some(Duration::from_secs(3)));
    assert_eq!(policy.delay_for(6, 0.0), None);
}

#[test]
fn test_jitter_stays_in_band() {
    let policy = RestartPolicy {
        jitter: 0.1,
        ..Default::default()
    };
    let high = policy.delay_for(1, 1.0).unwrap();
    let low = policy.delay_for(1, -1.0).unwrap();
    assert!(high > Duration::from_millis(1099) && high <= Duration::from_millis(1100));
    assert!(low > Duration::from_millis(899) && low <= Duration::from_millis(900));
    for _ in 0..100 {
        let d = policy.next_delay(1).unwrap();
        assert!(d > Duration::from_millis(899) && d <= Duration::from_millis(1100));
    }
}

#[tokio::test]
async fn test_missed_heartbeats_crash_then_restart() {
    let (mut supervisor, _handle, launcher) = setup(RestartPolicy {
        base_backoff: Duration::from_millis(1),
        jitter: 0.0,
        ..Default::default()
    });
    start(&supervisor).await;
    launcher.hang(&asr());

    let later = Instant::now() + Duration::from_secs(2);
    supervisor.check(later).await;
    assert_eq!(supervisor.loader.registry().state(&asr()), Some(AgentState::Crashed));

    // One pass schedules the restart, the next runs it.
    supervisor.check(later + Duration::from_secs(1)).await;
    supervisor.check(later + Duration::from_secs(2)).await;
    wait_for_state(&supervisor, AgentState::Running).await;

    assert_eq!(launcher.launch_count(&asr()), 2);
    assert_eq!(supervisor.loader.registry().get(&asr()).unwrap().restarts, 1);
}

#[tokio::test]
async fn test_restart_budget_exhausted_marks_failed() {
    let (mut supervisor, _handle, launcher) = setup(RestartPolicy {
        max_restarts: 0,
        ..Default::default()
    });
    start(&supervisor).await;
    launcher.hang(&asr());

    let later = Instant::now() + Duration::from_secs(2);
    supervisor.check(later).await;
    supervisor.check(later + Duration::from_secs(60)).await;

    assert_eq!(supervisor.loader.registry().state(&asr()), Some(AgentState::Failed));
    assert_eq!(launcher.launch_count(&asr()), 1);
}

#[tokio::test]
async fn test_stuck_startup_is_crashed() {
    let (mut supervisor, _handle, _launcher) = setup(RestartPolicy::default());
    supervisor.loader.registry().claim_start(&asr()).unwrap();

    supervisor.check(Instant::now() + Duration::from_secs(2)).await;

    let agent = supervisor.loader.registry().get(&asr()).unwrap();
    assert_eq!(agent.state, AgentState::Crashed);
    assert_eq!(agent.last_error.as_deref(), Some("startup deadline passed"));
}

#[tokio::test]
async fn test_crash_report_over_channel() {
    let (supervisor, handle, _launcher) = setup(RestartPolicy {
        max_restarts: 0,
        ..Default::default()
    });
    start(&supervisor).await;
    let registry = supervisor.loader.registry().clone();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(cancel.clone()));

    assert!(handle.report_crash(asr(), "segfault").await);
    let mut rx = registry.subscribe(&asr()).unwrap();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == AgentState::Failed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(registry.get(&asr()).unwrap().last_error.as_deref(), Some("segfault"));

    cancel.cancel();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_leaves_agent_dormant() {
    let (mut supervisor, _handle, _launcher) = setup(RestartPolicy::default());
    start(&supervisor).await;

    supervisor.handle(SupervisorCommand::Stop(asr())).await;
    assert_eq!(supervisor.loader.registry().state(&asr()), Some(AgentState::Dormant));
}
