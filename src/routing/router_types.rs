//! Request, decision and error types for the hybrid router.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::{ActivationError, AgentId};
use crate::models::{LoadError, ModelHandle, ModelId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One unit of work entering the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload_ref: String,
    /// Payload size hint for the complexity heuristic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_model: Option<ModelId>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub deadline_ms: u64,
}

impl TaskRequest {
    pub fn new(id: &str, task_type: &str, deadline_ms: u64) -> Self {
        Self {
            id: id.to_string(),
            task_type: task_type.to_string(),
            payload_ref: String::new(),
            payload_bytes: None,
            required_model: None,
            priority: TaskPriority::Normal,
            deadline_ms,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.required_model = Some(ModelId::from(model));
        self
    }

    pub fn with_payload_bytes(mut self, bytes: u64) -> Self {
        self.payload_bytes = Some(bytes);
        self
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Local,
    Remote,
    /// Served by the failover backend because the preferred one is tripped.
    Degraded,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Local => "local",
            Decision::Remote => "remote",
            Decision::Degraded => "degraded",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of how a task was routed. Replayed verbatim for retries
/// of the same task id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub task_id: String,
    pub decision: Decision,
    pub backend_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_handle: Option<ModelHandle>,
    pub complexity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentId>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Activation(#[from] ActivationError),
}
