//! Status command implementation.

use serde::{Deserialize, Serialize};

use super::client::{CliError, CliIpcClient};
use super::status_format::print_status_human;
use crate::health::{HealthSnapshot, RecordKind};
use crate::routing::CircuitState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub health: HealthState,
    pub version: String,
    #[serde(flatten)]
    pub snapshot: HealthSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Degraded => write!(f, "degraded"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl HealthState {
    /// Failed models or agents are unhealthy; tripped breakers and
    /// crashed (restarting) agents are degraded.
    pub fn assess(snapshot: &HealthSnapshot) -> Self {
        if snapshot.records.iter().any(|r| r.state == "failed") {
            return HealthState::Unhealthy;
        }
        let crashed = snapshot
            .records
            .iter()
            .any(|r| r.kind == RecordKind::Agent && r.state == "crashed");
        let tripped = snapshot
            .breakers
            .iter()
            .any(|b| b.state != CircuitState::Closed);
        if crashed || tripped {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

impl SystemStatus {
    pub fn from_snapshot(snapshot: HealthSnapshot) -> Self {
        Self {
            health: HealthState::assess(&snapshot),
            version: env!("CARGO_PKG_VERSION").to_string(),
            snapshot,
        }
    }
}

/// Run the status command and display results.
pub async fn run_status(socket_path: &str, json_output: bool) -> i32 {
    match fetch_status(socket_path).await {
        Ok(status) => {
            if json_output {
                match serde_json::to_string_pretty(&status) {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Error encoding status: {}", e);
                        return 1;
                    }
                }
            } else {
                print_status_human(&status);
            }
            0
        }
        Err(e) => {
            eprintln!("Error fetching status: {}", e);
            match e {
                CliError::ConnectionFailed(_) | CliError::Timeout => 3,
                _ => 1,
            }
        }
    }
}

async fn fetch_status(socket_path: &str) -> Result<SystemStatus, CliError> {
    let client = CliIpcClient::new(socket_path.to_string());
    let snapshot = client.status().await?;
    Ok(SystemStatus::from_snapshot(snapshot))
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
