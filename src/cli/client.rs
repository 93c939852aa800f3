//! Control-plane client used by CLI commands.

use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;

use crate::health::HealthSnapshot;
use crate::ipc::{
    decode_message, encode_message, read_frame, write_frame, ActivationRequest, ActivationResponse,
    ErrorCode, IpcMessage, ProtocolError, RouteRequest, RouteResponse,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server error ({code:?}): {message}")]
    Server { code: ErrorCode, message: String },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub struct CliIpcClient {
    socket_path: String,
    timeout: Duration,
}

impl CliIpcClient {
    pub fn new(socket_path: String) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request on a fresh connection and return the reply.
    /// Server `error` replies are returned as `CliError::Server`.
    pub async fn request(&self, message: &IpcMessage) -> Result<IpcMessage, CliError> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| CliError::ConnectionFailed(format!("{}: {}", self.socket_path, e)))?;
            let bytes = encode_message(message)?;
            write_frame(&mut stream, &bytes).await?;
            let reply = read_frame(&mut stream).await?;
            Ok::<_, CliError>(decode_message(&reply)?)
        };
        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(IpcMessage::Error { code, message })) => Err(CliError::Server { code, message }),
            Ok(result) => result,
            Err(_) => Err(CliError::Timeout),
        }
    }

    pub async fn status(&self) -> Result<HealthSnapshot, CliError> {
        match self.request(&IpcMessage::StatusRequest).await? {
            IpcMessage::StatusResponse(snapshot) => Ok(snapshot),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse, CliError> {
        match self.request(&IpcMessage::RouteRequest(request)).await? {
            IpcMessage::RouteResponse(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn activate(&self, agent_id: &str, deadline_ms: u64) -> Result<ActivationResponse, CliError> {
        let request = IpcMessage::ActivationRequest(ActivationRequest {
            agent_id: agent_id.to_string(),
            deadline_ms,
        });
        match self.request(&request).await? {
            IpcMessage::ActivationResponse(resp) => Ok(resp),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(message: &IpcMessage) -> CliError {
    let text = serde_json::to_string(message).unwrap_or_else(|_| "<unencodable>".to_string());
    CliError::UnexpectedResponse(text)
}
