//! Agent launchers.
//!
//! A launcher only starts and stops agents. Readiness is always signalled
//! by the agent's own first heartbeat, never by the launcher returning.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::registry::{AgentDescriptor, AgentId, AgentRegistry};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Agent {0} has no launch command")]
    NoLaunchSpec(AgentId),

    #[error("Failed to spawn {agent}: {reason}")]
    Spawn { agent: AgentId, reason: String },
}

#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self, agent: &AgentDescriptor) -> Result<(), LaunchError>;

    /// Best-effort stop. Unknown or already stopped agents are not an error.
    async fn stop(&self, agent: &AgentId);
}

/// Runs each agent as a child process.
///
/// The child gets `GG_AGENT_ID` and `GG_ORCH_SOCKET_PATH` so it can send
/// heartbeats back over the control plane. An unexpected exit marks the
/// agent crashed; the supervisor takes it from there.
pub struct CommandLauncher {
    registry: Arc<AgentRegistry>,
    socket_path: String,
    running: DashMap<AgentId, CancellationToken>,
}

impl CommandLauncher {
    pub fn new(registry: Arc<AgentRegistry>, socket_path: impl Into<String>) -> Self {
        Self {
            registry,
            socket_path: socket_path.into(),
            running: DashMap::new(),
        }
    }
}

#[async_trait]
impl AgentLauncher for CommandLauncher {
    async fn launch(&self, agent: &AgentDescriptor) -> Result<(), LaunchError> {
        let spec = agent
            .launch
            .as_ref()
            .ok_or_else(|| LaunchError::NoLaunchSpec(agent.id.clone()))?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .env("GG_AGENT_ID", agent.id.as_str())
            .env("GG_ORCH_SOCKET_PATH", &self.socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                agent: agent.id.clone(),
                reason: e.to_string(),
            })?;

        let stop = CancellationToken::new();
        if let Some(previous) = self.running.insert(agent.id.clone(), stop.clone()) {
            previous.cancel();
        }
        tracing::info!(agent = %agent.id, program = %spec.program, pid = child.id(), "agent process spawned");

        let registry = self.registry.clone();
        let id = agent.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    let _ = child.kill().await;
                    tracing::debug!(agent = %id, "agent process stopped");
                }
                status = child.wait() => {
                    let reason = match status {
                        Ok(s) => format!("process exited: {}", s),
                        Err(e) => format!("wait failed: {}", e),
                    };
                    tracing::warn!(agent = %id, %reason, "agent process exited");
                    let _ = registry.mark_crashed(&id, &reason);
                }
            }
        });
        Ok(())
    }

    async fn stop(&self, agent: &AgentId) {
        if let Some((_, token)) = self.running.remove(agent) {
            token.cancel();
        }
    }
}

/// In-process launcher whose agents heartbeat on a timer. Used by
/// `serve --simulate` and in tests.
pub struct SimulatedLauncher {
    registry: Arc<AgentRegistry>,
    startup_delay: Duration,
    heartbeat_interval: Duration,
    delays: HashMap<AgentId, Duration>,
    silent: HashSet<AgentId>,
    running: DashMap<AgentId, CancellationToken>,
    launches: DashMap<AgentId, u64>,
    total: AtomicU64,
}

impl SimulatedLauncher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        startup_delay: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            registry,
            startup_delay,
            heartbeat_interval,
            delays: HashMap::new(),
            silent: HashSet::new(),
            running: DashMap::new(),
            launches: DashMap::new(),
            total: AtomicU64::new(0),
        }
    }

    /// Override the startup delay for one agent.
    pub fn with_delay(mut self, agent: &str, delay: Duration) -> Self {
        self.delays.insert(AgentId::from(agent), delay);
        self
    }

    /// The agent starts but never heartbeats.
    pub fn silent(mut self, agent: &str) -> Self {
        self.silent.insert(AgentId::from(agent));
        self
    }

    pub fn launch_count(&self, agent: &AgentId) -> u64 {
        self.launches.get(agent).map(|c| *c).unwrap_or(0)
    }

    pub fn total_launches(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Stop heartbeating without changing registry state, as a hung process
    /// would.
    pub fn hang(&self, agent: &AgentId) {
        if let Some((_, token)) = self.running.remove(agent) {
            token.cancel();
        }
    }
}

#[async_trait]
impl AgentLauncher for SimulatedLauncher {
    async fn launch(&self, agent: &AgentDescriptor) -> Result<(), LaunchError> {
        *self.launches.entry(agent.id.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);

        let stop = CancellationToken::new();
        if let Some(previous) = self.running.insert(agent.id.clone(), stop.clone()) {
            previous.cancel();
        }
        if self.silent.contains(&agent.id) {
            return Ok(());
        }

        let delay = self
            .delays
            .get(&agent.id)
            .copied()
            .unwrap_or(self.startup_delay);
        let interval = self.heartbeat_interval;
        let registry = self.registry.clone();
        let id = agent.id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if registry.heartbeat(&id).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self, agent: &AgentId) {
        self.hang(agent);
    }
}
