//! Dispatch of decoded control-plane requests to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use crate::agents::AgentId;
use crate::orchestrator::Orchestrator;

use super::protocol::{
    decode_message, encode_response, ActivationRequest, ActivationResponse, ActivationStatus,
    ErrorCode, IpcMessage, ProtocolError, RouteRequest, RouteResponse,
};

pub struct IpcHandler {
    orchestrator: Arc<Orchestrator>,
}

impl IpcHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Decode one frame, handle it and encode the reply.
    ///
    /// Malformed requests produce an `error` message rather than a
    /// transport error; only encoding failures are returned.
    pub async fn process(&self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let response = match decode_message(request) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting malformed request");
                IpcMessage::error(ErrorCode::InvalidRequest, e.to_string())
            }
        };
        encode_response(&response)
    }

    pub async fn handle(&self, message: IpcMessage) -> IpcMessage {
        match message {
            IpcMessage::RouteRequest(req) => self.route(req).await,
            IpcMessage::ActivationRequest(req) => self.activate(req).await,
            IpcMessage::Heartbeat { agent_id } => {
                let agent = AgentId::from(agent_id);
                match self.orchestrator.heartbeat(&agent) {
                    Ok(state) => IpcMessage::HeartbeatAck {
                        agent_id: agent.to_string(),
                        state,
                    },
                    Err(e) => IpcMessage::error(ErrorCode::NotFound, e.to_string()),
                }
            }
            IpcMessage::Hint { topic, confidence } => {
                let outcome = self.orchestrator.hint(&topic, confidence);
                IpcMessage::HintAck {
                    scheduled: outcome.scheduled,
                    skipped: outcome.skipped,
                }
            }
            IpcMessage::OutcomeReport { backend_id, outcome } => {
                if self.orchestrator.loader().backends().get(&backend_id).is_none() {
                    return IpcMessage::error(
                        ErrorCode::NotFound,
                        format!("Unknown backend: {}", backend_id),
                    );
                }
                let state = self.orchestrator.record_outcome(&backend_id, outcome);
                IpcMessage::OutcomeAck { backend_id, state }
            }
            IpcMessage::StatusRequest => {
                IpcMessage::StatusResponse(self.orchestrator.health_snapshot())
            }
            other => IpcMessage::error(
                ErrorCode::InvalidRequest,
                format!("Unexpected message: {}", message_type(&other)),
            ),
        }
    }

    async fn route(&self, req: RouteRequest) -> IpcMessage {
        if let Err(e) = req.validate() {
            return IpcMessage::error(ErrorCode::InvalidRequest, e.to_string());
        }
        let task = req.to_task();
        let response = match self.orchestrator.route(&task).await {
            Ok(decision) => RouteResponse::routed(decision),
            Err(e) => {
                tracing::info!(task = %task.id, error = %e, "route failed");
                RouteResponse::failed(task.id, &e)
            }
        };
        IpcMessage::RouteResponse(response)
    }

    async fn activate(&self, req: ActivationRequest) -> IpcMessage {
        if req.agent_id.is_empty() {
            return IpcMessage::error(ErrorCode::InvalidRequest, "Missing required field: agent_id");
        }
        let agent = AgentId::from(req.agent_id.as_str());
        let started = std::time::Instant::now();
        let response = match self
            .orchestrator
            .ensure(&agent, Duration::from_millis(req.deadline_ms))
            .await
        {
            Ok(ready) => ActivationResponse {
                agent_id: req.agent_id,
                status: ActivationStatus::Ready,
                elapsed_ms: ready.elapsed_ms,
                error: None,
                error_code: None,
            },
            Err(e) => ActivationResponse {
                agent_id: req.agent_id,
                status: (&e).into(),
                elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                error: Some(e.to_string()),
                error_code: Some((&e).into()),
            },
        };
        IpcMessage::ActivationResponse(response)
    }
}

fn message_type(message: &IpcMessage) -> &'static str {
    match message {
        IpcMessage::RouteRequest(_) => "route_request",
        IpcMessage::RouteResponse(_) => "route_response",
        IpcMessage::ActivationRequest(_) => "activation_request",
        IpcMessage::ActivationResponse(_) => "activation_response",
        IpcMessage::Heartbeat { .. } => "heartbeat",
        IpcMessage::HeartbeatAck { .. } => "heartbeat_ack",
        IpcMessage::Hint { .. } => "hint",
        IpcMessage::HintAck { .. } => "hint_ack",
        IpcMessage::OutcomeReport { .. } => "outcome_report",
        IpcMessage::OutcomeAck { .. } => "outcome_ack",
        IpcMessage::StatusRequest => "status_request",
        IpcMessage::StatusResponse(_) => "status_response",
        IpcMessage::Error { .. } => "error",
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
