//! Wire format types and schema for control-plane messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agents::{ActivationError, AgentState};
use crate::health::HealthSnapshot;
use crate::models::{LoadError, ModelHandle, ModelId};
use crate::routing::{
    CircuitState, Decision, Outcome, RouteDecision, RouteError, TaskPriority, TaskRequest,
};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable error codes for errors that cross the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    NotFound,
    InsufficientVram,
    LoadFailed,
    BackoffActive,
    DeadlineExceeded,
    InUse,
    DependencyTimeout,
    DependencyFailed,
    StartupTimeout,
    StartFailed,
    BackendUnavailable,
    Internal,
}

impl From<&LoadError> for ErrorCode {
    fn from(e: &LoadError) -> Self {
        match e {
            LoadError::NotFound(_) => ErrorCode::NotFound,
            LoadError::InsufficientVram { .. } => ErrorCode::InsufficientVram,
            LoadError::LoadFailed { .. } | LoadError::UnloadFailed { .. } => ErrorCode::LoadFailed,
            LoadError::BackoffActive { .. } => ErrorCode::BackoffActive,
            LoadError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            LoadError::InUse { .. } | LoadError::NotResident { .. } => ErrorCode::InUse,
            LoadError::NoBackend { .. } => ErrorCode::BackendUnavailable,
        }
    }
}

impl From<&ActivationError> for ErrorCode {
    fn from(e: &ActivationError) -> Self {
        match e {
            ActivationError::NotFound(_) => ErrorCode::NotFound,
            ActivationError::DependencyTimeout { .. } => ErrorCode::DependencyTimeout,
            ActivationError::DependencyFailed { .. } => ErrorCode::DependencyFailed,
            ActivationError::StartupTimeout(_) => ErrorCode::StartupTimeout,
            ActivationError::StartFailed { .. } => ErrorCode::StartFailed,
        }
    }
}

impl From<&RouteError> for ErrorCode {
    fn from(e: &RouteError) -> Self {
        match e {
            RouteError::BackendUnavailable { .. } | RouteError::UnknownBackend(_) => {
                ErrorCode::BackendUnavailable
            }
            RouteError::Load(e) => e.into(),
            RouteError::Activation(e) => e.into(),
        }
    }
}

/// Task submitted for routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub task_id: String,
    pub task_type: String,
    #[serde(default)]
    pub payload_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_model: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub deadline_ms: u64,
}

impl RouteRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.task_id.is_empty() {
            return Err(ProtocolError::MissingField("task_id".into()));
        }
        if self.task_type.is_empty() {
            return Err(ProtocolError::MissingField("task_type".into()));
        }
        if self.deadline_ms == 0 {
            return Err(ProtocolError::InvalidFormat("deadline_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn to_task(&self) -> TaskRequest {
        TaskRequest {
            id: self.task_id.clone(),
            task_type: self.task_type.clone(),
            payload_ref: self.payload_ref.clone(),
            payload_bytes: self.payload_bytes,
            required_model: self.required_model.as_deref().map(ModelId::from),
            priority: self.priority,
            deadline_ms: self.deadline_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_handle: Option<ModelHandle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl RouteResponse {
    pub fn routed(decision: RouteDecision) -> Self {
        Self {
            task_id: decision.task_id,
            decision: Some(decision.decision),
            backend_id: Some(decision.backend_id),
            model_handle: decision.model_handle,
            error: None,
            error_code: None,
        }
    }

    pub fn failed(task_id: String, error: &RouteError) -> Self {
        Self {
            task_id,
            decision: None,
            backend_id: None,
            model_handle: None,
            error: Some(error.to_string()),
            error_code: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub agent_id: String,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Ready,
    Timeout,
    DependencyFailed,
    /// The target itself could not start, or is not in the catalog.
    Failed,
}

impl From<&ActivationError> for ActivationStatus {
    fn from(e: &ActivationError) -> Self {
        match e {
            ActivationError::DependencyTimeout { .. } | ActivationError::StartupTimeout(_) => {
                ActivationStatus::Timeout
            }
            ActivationError::DependencyFailed { .. } => ActivationStatus::DependencyFailed,
            ActivationError::NotFound(_) | ActivationError::StartFailed { .. } => {
                ActivationStatus::Failed
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub agent_id: String,
    pub status: ActivationStatus,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[allow(clippy::large_enum_variant)]
pub enum IpcMessage {
    #[serde(rename = "route_request")]
    RouteRequest(RouteRequest),
    #[serde(rename = "route_response")]
    RouteResponse(RouteResponse),
    #[serde(rename = "activation_request")]
    ActivationRequest(ActivationRequest),
    #[serde(rename = "activation_response")]
    ActivationResponse(ActivationResponse),
    #[serde(rename = "heartbeat")]
    Heartbeat { agent_id: String },
    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck { agent_id: String, state: AgentState },
    #[serde(rename = "hint")]
    Hint { topic: String, confidence: f64 },
    #[serde(rename = "hint_ack")]
    HintAck { scheduled: Vec<ModelId>, skipped: Vec<ModelId> },
    #[serde(rename = "outcome_report")]
    OutcomeReport { backend_id: String, outcome: Outcome },
    #[serde(rename = "outcome_ack")]
    OutcomeAck { backend_id: String, state: CircuitState },
    #[serde(rename = "status_request")]
    StatusRequest,
    #[serde(rename = "status_response")]
    StatusResponse(HealthSnapshot),
    #[serde(rename = "error")]
    Error { code: ErrorCode, message: String },
}

impl IpcMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        IpcMessage::Error {
            code,
            message: message.into(),
        }
    }
}
