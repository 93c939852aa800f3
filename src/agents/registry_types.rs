//! Types for the agent registry.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default activation SLA per agent.
pub const DEFAULT_STARTUP_DEADLINE: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Dormant,
    Starting,
    Running,
    Crashed,
    /// Restart budget exhausted; only an explicit activation revives it.
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Dormant => "dormant",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Crashed => "crashed",
            AgentState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Dormant, Starting)
                | (Crashed, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Running, Crashed)
                | (Running, Dormant)
                | (Crashed, Failed)
                | (Crashed, Dormant)
        )
    }

    /// Terminal for the current activation attempt.
    pub fn is_down(&self) -> bool {
        matches!(self, AgentState::Crashed | AgentState::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to start an agent process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub dependencies: Vec<AgentId>,
    pub launch: Option<LaunchSpec>,
    pub startup_deadline: Duration,
    pub state: AgentState,
    pub last_heartbeat_at: Option<Instant>,
    pub started_at: Option<Instant>,
    /// Automatic restarts since the last stable run.
    pub restarts: u32,
    pub last_restart_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl AgentDescriptor {
    pub fn new(id: &str) -> Self {
        Self {
            id: AgentId::from(id),
            dependencies: Vec::new(),
            launch: None,
            startup_deadline: DEFAULT_STARTUP_DEADLINE,
            state: AgentState::Dormant,
            last_heartbeat_at: None,
            started_at: None,
            restarts: 0,
            last_restart_at: None,
            last_error: None,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| AgentId::from(*d)).collect();
        self
    }

    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    pub fn with_startup_deadline(mut self, deadline: Duration) -> Self {
        self.startup_deadline = deadline;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentTransition {
    pub agent: AgentId,
    pub from: AgentState,
    pub to: AgentState,
    pub at: Instant,
}

/// Result of trying to claim an agent for startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartClaim {
    /// Caller moved the agent to `Starting` and must launch it.
    Launch,
    /// Someone else is starting it.
    AlreadyStarting,
    AlreadyRunning,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent already registered: {0}")]
    Duplicate(AgentId),

    #[error("Agent not found: {0}")]
    NotFound(AgentId),

    #[error("Invalid transition for {agent}: {from} -> {to}")]
    InvalidTransition {
        agent: AgentId,
        from: AgentState,
        to: AgentState,
    },
}
