//! Agent supervisor.
//!
//! A single task polls heartbeats and startup deadlines, marks silent agents
//! crashed and restarts them under [`RestartPolicy`]. Other components talk
//! to it through a [`SupervisorHandle`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::lazy_loader::LazyAgentLoader;
use super::registry::{AgentDescriptor, AgentId, AgentState};

/// Restart backoff and budget. Pure; the supervisor supplies the clock and
/// the randomness.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Automatic restarts before the agent is marked `Failed`.
    pub max_restarts: u32,
    /// Fraction of the delay added or removed at random.
    pub jitter: f64,
    /// A run this long without crashing clears the restart count.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_restarts: 3,
            jitter: 0.1,
            stable_after: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based), with `sample` in
    /// `[-1, 1]` scaling the jitter. `None` once the budget is spent.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_restarts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let base = self
            .base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        let scale = 1.0 + self.jitter * sample.clamp(-1.0, 1.0);
        Some(base.mul_f64(scale.max(0.0)))
    }

    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let sample = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_for(attempt, sample)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub policy: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            policy: RestartPolicy::default(),
        }
    }
}

impl SupervisorConfig {
    /// Silence longer than this means the agent is gone.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

#[derive(Debug)]
pub enum SupervisorCommand {
    /// Out-of-band crash report, e.g. from a process watcher.
    ReportCrash { agent: AgentId, reason: String },
    /// Stop a running agent and leave it dormant.
    Stop(AgentId),
}

#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    pub async fn report_crash(&self, agent: AgentId, reason: impl Into<String>) -> bool {
        self.tx
            .send(SupervisorCommand::ReportCrash {
                agent,
                reason: reason.into(),
            })
            .await
            .is_ok()
    }

    pub async fn stop(&self, agent: AgentId) -> bool {
        self.tx.send(SupervisorCommand::Stop(agent)).await.is_ok()
    }
}

pub struct Supervisor {
    loader: LazyAgentLoader,
    config: SupervisorConfig,
    rx: mpsc::Receiver<SupervisorCommand>,
    /// Crashed agents waiting for their restart time.
    scheduled: HashMap<AgentId, Instant>,
}

impl Supervisor {
    pub fn new(loader: LazyAgentLoader, config: SupervisorConfig) -> (Self, SupervisorHandle) {
        let (tx, rx) = mpsc::channel(64);
        let supervisor = Self {
            loader,
            config,
            rx,
            scheduled: HashMap::new(),
        };
        (supervisor, SupervisorHandle { tx })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            heartbeat_ms = self.config.heartbeat_interval.as_millis() as u64,
            "agent supervisor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check(Instant::now()).await,
                Some(cmd) = self.rx.recv() => self.handle(cmd).await,
            }
        }
        tracing::info!("agent supervisor stopped");
    }

    async fn handle(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::ReportCrash { agent, reason } => {
                self.crash(&agent, &reason).await;
            }
            SupervisorCommand::Stop(agent) => {
                self.scheduled.remove(&agent);
                self.loader.launcher().stop(&agent).await;
                let registry = self.loader.registry();
                let _ = registry
                    .transition(&agent, AgentState::Dormant)
                    .map(|_| tracing::info!(agent = %agent, "agent stopped"));
            }
        }
    }

    /// One supervision pass as of `now`.
    pub async fn check(&mut self, now: Instant) {
        for agent in self.loader.registry().snapshot() {
            match agent.state {
                AgentState::Running => self.check_running(&agent, now).await,
                AgentState::Starting => {
                    let started = agent.started_at.unwrap_or(now);
                    if now.saturating_duration_since(started) > agent.startup_deadline {
                        self.crash(&agent.id, "startup deadline passed").await;
                    }
                }
                AgentState::Crashed => self.schedule_restart(&agent, now),
                AgentState::Dormant | AgentState::Failed => {
                    self.scheduled.remove(&agent.id);
                }
            }
        }
        self.restart_due(now);
    }

    async fn check_running(&mut self, agent: &AgentDescriptor, now: Instant) {
        let last = agent.last_heartbeat_at.or(agent.started_at).unwrap_or(now);
        if now.saturating_duration_since(last) > self.config.heartbeat_timeout() {
            self.crash(&agent.id, "missed heartbeats").await;
            return;
        }
        if agent.restarts > 0 {
            if let Some(at) = agent.last_restart_at {
                if now.saturating_duration_since(at) > self.config.policy.stable_after {
                    self.loader.registry().reset_restarts(&agent.id);
                }
            }
        }
    }

    fn schedule_restart(&mut self, agent: &AgentDescriptor, now: Instant) {
        if self.scheduled.contains_key(&agent.id) {
            return;
        }
        match self.config.policy.next_delay(agent.restarts + 1) {
            Some(delay) => {
                tracing::info!(
                    agent = %agent.id,
                    attempt = agent.restarts + 1,
                    delay_ms = delay.as_millis() as u64,
                    "agent restart scheduled"
                );
                self.scheduled.insert(agent.id.clone(), now + delay);
            }
            None => {
                if self
                    .loader
                    .registry()
                    .transition(&agent.id, AgentState::Failed)
                    .is_ok()
                {
                    tracing::error!(
                        agent = %agent.id,
                        restarts = agent.restarts,
                        last_error = agent.last_error.as_deref().unwrap_or(""),
                        "agent failed permanently"
                    );
                }
            }
        }
    }

    fn restart_due(&mut self, now: Instant) {
        let due: Vec<AgentId> = self
            .scheduled
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in due {
            self.scheduled.remove(&id);
            let registry = self.loader.registry();
            let Some(agent) = registry.get(&id) else {
                continue;
            };
            if agent.state != AgentState::Crashed {
                continue;
            }
            let attempt = registry.note_restart(&id).unwrap_or(0);
            metrics::counter!("orchestrator_agent_restarts_total").increment(1);

            let loader = self.loader.clone();
            let deadline = tokio::time::Instant::now() + agent.startup_deadline;
            tokio::spawn(async move {
                match loader.ensure(&id, deadline).await {
                    Ok(_) => tracing::info!(agent = %id, attempt, "agent restarted"),
                    Err(e) => tracing::warn!(agent = %id, attempt, error = %e, "agent restart failed"),
                }
            });
        }
    }

    async fn crash(&mut self, agent: &AgentId, reason: &str) {
        if self.loader.registry().mark_crashed(agent, reason).is_ok() {
            tracing::warn!(agent = %agent, reason, "agent crashed");
            self.loader.launcher().stop(agent).await;
        }
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
