//! Logging setup and the serve command.

use std::process::ExitCode;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use gg_orchestrator::config;
use gg_orchestrator::ipc::{run_server, IpcHandler};
use gg_orchestrator::Orchestrator;

const LOG_FORMAT_ENV: &str = "GG_ORCH_LOG_FORMAT";

/// Install the global subscriber: `RUST_LOG` filter (default `info`),
/// JSON lines when `GG_ORCH_LOG_FORMAT=json`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Load configuration, start background tasks and serve until Ctrl-C.
pub async fn run_serve(config_path: Option<&str>, simulate: bool) -> ExitCode {
    let config = match config::load(config_path, simulate) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration rejected");
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(2u8);
        }
    };
    let socket_path = config.ipc.socket_path.clone();
    let max_connections = config.ipc.max_connections;

    let orchestrator = match Orchestrator::build(config) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            tracing::error!(error = %e, "initialization failed");
            return ExitCode::from(2u8);
        }
    };

    let cancel = CancellationToken::new();
    let tasks = orchestrator.start(cancel.clone());
    let handler = Arc::new(IpcHandler::new(Arc::clone(&orchestrator)));
    let mut server = tokio::spawn({
        let cancel = cancel.clone();
        async move { run_server(&socket_path, handler, max_connections, cancel).await }
    });

    let finished = tokio::select! {
        result = &mut server => Some(result),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
            None
        }
    };
    cancel.cancel();

    let outcome = match finished {
        Some(result) => result,
        None => server.await,
    };
    let code = match outcome {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "server error");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!(error = %e, "server task panicked");
            ExitCode::FAILURE
        }
    };
    futures::future::join_all(tasks).await;
    tracing::info!("shutdown complete");
    code
}
