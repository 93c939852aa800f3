//! Lazy Agent Loader - dependency-aware, deadline-bounded activation.
//!
//! `ensure` walks the dependency order, starting only agents that are not
//! already running. Each activation gets its own slice of what is left of
//! the caller's deadline. An agent that misses its slice is left in
//! `Starting`; the supervisor watches its startup deadline from there.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use super::graph::{AgentGraph, GraphError};
use super::launcher::AgentLauncher;
use super::registry::{AgentError, AgentId, AgentRegistry, AgentState, StartClaim};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("Agent not found: {0}")]
    NotFound(AgentId),

    #[error("Dependency {dependency} of {agent} did not start in time")]
    DependencyTimeout { agent: AgentId, dependency: AgentId },

    #[error("Dependency {dependency} of {agent} failed: {reason}")]
    DependencyFailed {
        agent: AgentId,
        dependency: AgentId,
        reason: String,
    },

    #[error("Agent {0} did not become ready in time")]
    StartupTimeout(AgentId),

    #[error("Agent {agent} failed to start: {reason}")]
    StartFailed { agent: AgentId, reason: String },
}

/// Successful activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub agent: AgentId,
    pub elapsed_ms: u64,
    /// Agents this call started, in activation order.
    pub activated: Vec<AgentId>,
}

#[derive(Debug, Clone)]
pub struct ActivationConfig {
    /// Smallest slice any single activation gets, even when the overall
    /// deadline is nearly spent. Never more than the remaining time.
    pub per_agent_floor: Duration,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            per_agent_floor: Duration::from_millis(2_000),
        }
    }
}

/// Time budget for the next activation: the remaining time split evenly
/// over the agents still to start, raised to the floor, capped by the
/// remaining time and the agent's own SLA.
pub fn activation_slice(
    remaining: Duration,
    agents_left: usize,
    floor: Duration,
    agent_deadline: Duration,
) -> Duration {
    let share = remaining / u32::try_from(agents_left.max(1)).unwrap_or(u32::MAX);
    share.max(floor).min(remaining).min(agent_deadline)
}

enum StepFailure {
    Timeout,
    Failed(String),
}

#[derive(Clone)]
pub struct LazyAgentLoader {
    registry: Arc<AgentRegistry>,
    graph: Arc<AgentGraph>,
    launcher: Arc<dyn AgentLauncher>,
    config: ActivationConfig,
}

impl LazyAgentLoader {
    pub fn new(
        registry: Arc<AgentRegistry>,
        graph: Arc<AgentGraph>,
        launcher: Arc<dyn AgentLauncher>,
        config: ActivationConfig,
    ) -> Self {
        Self {
            registry,
            graph,
            launcher,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn launcher(&self) -> &Arc<dyn AgentLauncher> {
        &self.launcher
    }

    /// Bring `agent` and its dependencies to `Running` before `deadline`.
    pub async fn ensure(&self, agent: &AgentId, deadline: Instant) -> Result<Ready, ActivationError> {
        let started = Instant::now();
        let order = self.graph.activation_order(agent).map_err(|e| match e {
            GraphError::NotFound(id) => ActivationError::NotFound(id),
            other => ActivationError::StartFailed {
                agent: agent.clone(),
                reason: other.to_string(),
            },
        })?;
        let pending: Vec<AgentId> = order
            .into_iter()
            .filter(|a| self.registry.state(a) != Some(AgentState::Running))
            .collect();

        let mut activated = Vec::new();
        let total = pending.len();
        for (i, current) in pending.iter().enumerate() {
            let is_target = current == agent;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let sla = self
                .registry
                .get(current)
                .map(|d| d.startup_deadline)
                .ok_or_else(|| ActivationError::NotFound(current.clone()))?;
            let slice = activation_slice(remaining, total - i, self.config.per_agent_floor, sla);

            match self.activate(current, slice).await {
                Ok(true) => activated.push(current.clone()),
                Ok(false) => {}
                Err(failure) => {
                    let err = match (failure, is_target) {
                        (StepFailure::Timeout, true) => ActivationError::StartupTimeout(current.clone()),
                        (StepFailure::Timeout, false) => ActivationError::DependencyTimeout {
                            agent: agent.clone(),
                            dependency: current.clone(),
                        },
                        (StepFailure::Failed(reason), true) => ActivationError::StartFailed {
                            agent: current.clone(),
                            reason,
                        },
                        (StepFailure::Failed(reason), false) => ActivationError::DependencyFailed {
                            agent: agent.clone(),
                            dependency: current.clone(),
                            reason,
                        },
                    };
                    tracing::warn!(agent = %agent, step = %current, slice_ms = slice.as_millis() as u64, error = %err, "activation failed");
                    return Err(err);
                }
            }
        }

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !activated.is_empty() {
            tracing::info!(agent = %agent, activated = activated.len(), elapsed_ms, "agent ready");
        }
        Ok(Ready {
            agent: agent.clone(),
            elapsed_ms,
            activated,
        })
    }

    /// Start one agent (or join a start in progress) and wait up to `slice`
    /// for its first heartbeat. Returns whether this call launched it.
    async fn activate(&self, agent: &AgentId, slice: Duration) -> Result<bool, StepFailure> {
        let claim = self.registry.claim_start(agent).map_err(not_found)?;
        let mut rx = self.registry.subscribe(agent).map_err(not_found)?;

        let launched = match claim {
            StartClaim::AlreadyRunning => return Ok(false),
            StartClaim::AlreadyStarting => false,
            StartClaim::Launch => {
                let descriptor = self
                    .registry
                    .get(agent)
                    .ok_or_else(|| StepFailure::Failed(format!("agent {} vanished", agent)))?;
                tracing::debug!(agent = %agent, slice_ms = slice.as_millis() as u64, "launching agent");
                if let Err(e) = self.launcher.launch(&descriptor).await {
                    let _ = self.registry.mark_crashed(agent, &e.to_string());
                    return Err(StepFailure::Failed(e.to_string()));
                }
                true
            }
        };

        let ready = rx.wait_for(|s| *s == AgentState::Running || s.is_down());
        let settled = tokio::time::timeout(slice, ready).await;
        match settled {
            Ok(Ok(state)) if *state == AgentState::Running => Ok(launched),
            Ok(Ok(state)) => Err(StepFailure::Failed(format!("agent {}", *state))),
            Ok(Err(_)) => Err(StepFailure::Failed("state channel closed".into())),
            Err(_) => Err(StepFailure::Timeout),
        }
    }
}

fn not_found(e: AgentError) -> StepFailure {
    StepFailure::Failed(e.to_string())
}

#[cfg(test)]
#[path = "lazy_loader_tests.rs"]
mod tests;
