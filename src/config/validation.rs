//! Startup validation of a parsed configuration.
//!
//! Runs before any component is built. A failure here halts startup.

use std::collections::HashSet;
use std::path::PathBuf;

use thiserror::Error;

use super::types::OrchestratorConfig;
use crate::agents::{AgentDescriptor, AgentGraph, GraphError};
use crate::models::BackendKind;
use crate::routing::{RuleError, RuleSet};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Reserved VRAM {reserved} exceeds total {total}")]
    ReservedExceedsTotal { reserved: u64, total: u64 },

    #[error("{field} = {value} is outside [0, 1]")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Low watermark {low} must be below high watermark {high}")]
    Watermarks { low: f64, high: f64 },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("Duplicate {kind} id: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("{field} references unknown backend {backend}")]
    UnknownBackend { field: String, backend: String },

    #[error("Model {model} needs a {kind} backend but none is configured")]
    NoBackendForKind { model: String, kind: BackendKind },

    #[error("Topic {topic} references unknown model {model}")]
    UnknownModel { topic: String, model: String },

    #[error("Rule {rule} references unknown agent {agent}")]
    UnknownAgent { rule: String, agent: String },

    #[error("Agent graph: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

fn unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { field, value })
    }
}

fn unique<'a>(kind: &'static str, ids: impl Iterator<Item = &'a str>) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::Duplicate {
                kind,
                id: id.to_string(),
            });
        }
    }
    Ok(seen)
}

impl OrchestratorConfig {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_numbers()?;

        let backends = unique("backend", self.backends.iter().map(|b| b.id.as_str()))?;
        let known_backend = |field: String, backend: &str| {
            if backends.contains(backend) {
                Ok(())
            } else {
                Err(ConfigError::UnknownBackend {
                    field,
                    backend: backend.to_string(),
                })
            }
        };

        let models: Vec<_> = self.models.iter().map(|m| m.to_descriptor()).collect();
        let model_ids = unique("model", models.iter().map(|m| m.id.as_str()))?;
        for model in &models {
            let covered = self.backends.iter().any(|b| b.kind == model.backend_kind);
            if !covered {
                return Err(ConfigError::NoBackendForKind {
                    model: model.id.to_string(),
                    kind: model.backend_kind,
                });
            }
        }
        unique("topic", self.preloader.topics.iter().map(|t| t.topic.as_str()))?;
        for topic in &self.preloader.topics {
            if let Some(missing) = topic.models.iter().find(|m| !model_ids.contains(m.as_str())) {
                return Err(ConfigError::UnknownModel {
                    topic: topic.topic.clone(),
                    model: missing.clone(),
                });
            }
        }

        let routing = &self.routing;
        known_backend("routing.local_backend".into(), routing.local_backend.as_str())?;
        known_backend("routing.heavy_backend".into(), routing.heavy_backend.as_str())?;
        if let Some(failover) = &routing.failover_backend {
            known_backend("routing.failover_backend".into(), failover.as_str())?;
        }
        RuleSet::compile(&routing.rules, routing.default_complexity, routing.payload())?;

        let agents: Vec<AgentDescriptor> =
            self.agents.catalog.iter().map(|a| a.to_descriptor()).collect();
        let agent_ids = unique("agent", self.agents.catalog.iter().map(|a| a.id.as_str()))?;
        AgentGraph::new(&agents)?;

        for rule in &routing.rules {
            for backend in [&rule.preferred_backend, &rule.failover_backend].into_iter().flatten() {
                known_backend(format!("routing.rules.{}", rule.name), backend.as_str())?;
            }
            if let Some(agent) = &rule.agent {
                if !agent_ids.contains(agent.as_str()) {
                    return Err(ConfigError::UnknownAgent {
                        rule: rule.name.clone(),
                        agent: agent.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_numbers(&self) -> Result<(), ConfigError> {
        if self.vram.reserved_bytes > self.vram.total_bytes {
            return Err(ConfigError::ReservedExceedsTotal {
                reserved: self.vram.reserved_bytes,
                total: self.vram.total_bytes,
            });
        }
        unit_interval("eviction.high_watermark", self.eviction.high_watermark)?;
        unit_interval("eviction.low_watermark", self.eviction.low_watermark)?;
        if self.eviction.low_watermark >= self.eviction.high_watermark {
            return Err(ConfigError::Watermarks {
                low: self.eviction.low_watermark,
                high: self.eviction.high_watermark,
            });
        }
        unit_interval("preloader.confidence_threshold", self.preloader.confidence_threshold)?;
        unit_interval("routing.heavy_threshold", self.routing.heavy_threshold)?;
        unit_interval("routing.default_complexity", self.routing.default_complexity)?;
        unit_interval("agents.restart_jitter", self.agents.restart_jitter)?;

        let nonzero = [
            ("eviction.interval_ms", self.eviction.interval_ms),
            ("agents.heartbeat_interval_ms", self.agents.heartbeat_interval_ms),
            ("agents.poll_interval_ms", self.agents.poll_interval_ms),
            ("breaker.failure_threshold", u64::from(self.breaker.failure_threshold)),
            ("breaker.probe_budget", u64::from(self.breaker.probe_budget)),
            ("health.interval_ms", self.health.interval_ms),
            ("health.gc_interval_ms", self.health.gc_interval_ms),
            ("ipc.max_connections", self.ipc.max_connections as u64),
        ];
        if let Some((field, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        Ok(())
    }
}
