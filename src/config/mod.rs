//! Static configuration: model catalog, backends, agent graph, routing
//! table, VRAM budget and timing constants. Loaded once at startup.
//!
//! Environment:
//! - `GG_ORCH_CONFIG`: config file path when `--config` is not given
//! - `GG_ORCH_SOCKET_PATH`: overrides `ipc.socket_path`

mod types;
mod validation;

use std::path::{Path, PathBuf};

pub use types::*;
pub use validation::ConfigError;

pub const CONFIG_ENV: &str = "GG_ORCH_CONFIG";
pub const SOCKET_ENV: &str = "GG_ORCH_SOCKET_PATH";

impl OrchestratorConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply environment overrides already read by the caller.
    pub fn with_overrides(mut self, socket_path: Option<String>) -> Self {
        if let Some(path) = socket_path.filter(|p| !p.is_empty()) {
            self.ipc.socket_path = path;
        }
        self
    }
}

/// Path from the command line, else `GG_ORCH_CONFIG`.
pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
    cli_path
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

/// Bundled demo configuration: simulated backends and agents.
pub const DEMO_CONFIG: &str = include_str!("../../config/orchestrator.example.toml");

/// Load, apply environment overrides and validate.
///
/// Without a config path, `simulate` selects the bundled demo
/// configuration; otherwise the built-in defaults are used.
pub fn load(cli_path: Option<&str>, simulate: bool) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = match resolve_path(cli_path) {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading configuration");
            OrchestratorConfig::from_file(&path)?
        }
        None if simulate => {
            tracing::info!("no configuration file given; using bundled demo configuration");
            OrchestratorConfig::from_toml_str(DEMO_CONFIG)?
        }
        None => {
            tracing::warn!("no configuration file given; using defaults");
            OrchestratorConfig::default()
        }
    };
    if simulate {
        config.agents.launcher = LauncherKind::Simulated;
    }
    let config = config.with_overrides(std::env::var(SOCKET_ENV).ok());
    config.validate()?;
    Ok(config)
}

/// Socket path for CLI clients: `GG_ORCH_SOCKET_PATH` or the default.
pub fn socket_path_from_env() -> String {
    std::env::var(SOCKET_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
