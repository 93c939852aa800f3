//! Control-plane server loop over a Unix domain socket.
//!
//! All connections use length-prefixed framing (4-byte LE + payload)
//! matching the CLI client in `cli::client`.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::handler::IpcHandler;
use super::protocol::{encode_message, read_frame, write_frame, ErrorCode, IpcMessage, ProtocolError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Handle one connection: read requests, dispatch, write responses.
async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    handler: Arc<IpcHandler>,
    _permit: OwnedSemaphorePermit,
) {
    loop {
        let request_bytes = match read_frame(&mut stream).await {
            Ok(bytes) => bytes,
            Err(ProtocolError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break; // Client disconnected
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection read error");
                if let Ok(bytes) = encode_message(&IpcMessage::error(ErrorCode::InvalidRequest, e.to_string())) {
                    let _ = write_frame(&mut stream, &bytes).await;
                }
                break;
            }
        };

        match handler.process(&request_bytes).await {
            Ok(response_bytes) => {
                if let Err(e) = write_frame(&mut stream, &response_bytes).await {
                    tracing::warn!(error = %e, "connection write error");
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to encode response");
                break;
            }
        }
    }
}

/// Acquire a connection permit and spawn a handler task.
fn spawn_connection<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    stream: S,
    handler: &Arc<IpcHandler>,
    connections: &Arc<Semaphore>,
) {
    let permit = match Arc::clone(connections).try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            tracing::warn!("connection limit reached, rejecting client");
            return;
        }
    };
    let handler = Arc::clone(handler);
    tokio::spawn(async move {
        handle_connection(stream, handler, permit).await;
    });
}

/// Serve until `cancel` fires. A stale socket file is replaced and the
/// socket is removed on shutdown.
pub async fn run_server(
    socket_path: &str,
    handler: Arc<IpcHandler>,
    max_connections: usize,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let _ = std::fs::remove_file(socket_path);

    let listener = UnixListener::bind(socket_path).map_err(|source| ServerError::Bind {
        path: socket_path.to_string(),
        source,
    })?;
    tracing::info!(socket = socket_path, max_connections, "control plane listening");
    let connections = Arc::new(Semaphore::new(max_connections));

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => spawn_connection(stream, &handler, &connections),
                    Err(e) => tracing::warn!(error = %e, "accept error"),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("control plane shutting down");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, DEMO_CONFIG};
    use crate::orchestrator::Orchestrator;
    use tokio::net::UnixStream;

    async fn request(stream: &mut UnixStream, message: &IpcMessage) -> IpcMessage {
        let bytes = encode_message(message).unwrap();
        write_frame(stream, &bytes).await.unwrap();
        let reply = read_frame(stream).await.unwrap();
        super::super::protocol::decode_message(&reply).unwrap()
    }

    #[tokio::test]
    async fn test_serves_requests_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("orch.sock");
        let socket = socket.to_str().unwrap().to_string();

        let config = OrchestratorConfig::from_toml_str(DEMO_CONFIG).unwrap();
        let orchestrator = Arc::new(Orchestrator::build(config).unwrap());
        let handler = Arc::new(IpcHandler::new(orchestrator));
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let socket = socket.clone();
            let cancel = cancel.clone();
            async move { run_server(&socket, handler, 4, cancel).await }
        });

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let mut stream = stream.expect("server did not start");

        let reply = request(&mut stream, &IpcMessage::StatusRequest).await;
        assert!(matches!(reply, IpcMessage::StatusResponse(_)));

        // Same connection serves a second request.
        let reply = request(
            &mut stream,
            &IpcMessage::Hint {
                topic: "unknown".into(),
                confidence: 0.99,
            },
        )
        .await;
        assert!(matches!(reply, IpcMessage::HintAck { ref scheduled, .. } if scheduled.is_empty()));

        drop(stream);
        cancel.cancel();
        server.await.unwrap().unwrap();
        assert!(!std::path::Path::new(&socket).exists());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("orch.sock");
        let socket = socket.to_str().unwrap().to_string();

        let config = OrchestratorConfig::from_toml_str(DEMO_CONFIG).unwrap();
        let handler = Arc::new(IpcHandler::new(Arc::new(Orchestrator::build(config).unwrap())));
        let cancel = CancellationToken::new();
        let server = tokio::spawn({
            let socket = socket.clone();
            let cancel = cancel.clone();
            async move { run_server(&socket, handler, 4, cancel).await }
        });

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = UnixStream::connect(&socket).await {
                stream = Some(s);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let mut stream = stream.expect("server did not start");

        use tokio::io::AsyncWriteExt;
        let len = (crate::ipc::protocol::MAX_FRAME_SIZE as u32) + 1;
        stream.write_all(&len.to_le_bytes()).await.unwrap();
        let reply = read_frame(&mut stream).await.unwrap();
        let reply = super::super::protocol::decode_message(&reply).unwrap();
        assert!(matches!(reply, IpcMessage::Error { code: ErrorCode::InvalidRequest, .. }));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
