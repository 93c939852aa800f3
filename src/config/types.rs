//! Configuration file schema.
//!
//! Every section has defaults, so an empty file is a valid (if useless)
//! configuration. Durations are integer milliseconds.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agents::{
    ActivationConfig, AgentDescriptor, LaunchSpec, RestartPolicy, SupervisorConfig,
};
use crate::memory::MonitorConfig;
use crate::models::{
    BackendKind, LoaderConfig, ModelDescriptor, ModelId, PreloaderConfig, SimulatedBackendConfig,
};
use crate::routing::{BreakerConfig, PayloadBoost, RouterConfig, RoutingRuleConfig};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/gg-orchestrator.sock";

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub vram: VramSection,
    pub loader: LoaderSection,
    pub eviction: EvictionSection,
    pub preloader: PreloaderSection,
    pub agents: AgentsSection,
    pub routing: RoutingSection,
    pub breaker: BreakerSection,
    pub health: HealthSection,
    pub ipc: IpcSection,
    pub models: Vec<ModelEntry>,
    pub backends: Vec<BackendEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VramSection {
    pub total_bytes: u64,
    /// Safety margin never handed out.
    pub reserved_bytes: u64,
}

impl Default for VramSection {
    fn default() -> Self {
        Self {
            total_bytes: 8 * 1024 * 1024 * 1024,
            reserved_bytes: 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderSection {
    pub max_parallel_loads: usize,
    pub backend_load_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_retries: u32,
    pub failed_ttl_ms: u64,
    /// Deadline for demand loads that arrive without one.
    pub default_load_timeout_ms: u64,
}

impl Default for LoaderSection {
    fn default() -> Self {
        Self {
            max_parallel_loads: 2,
            backend_load_timeout_ms: 120_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            max_retries: 3,
            failed_ttl_ms: 300_000,
            default_load_timeout_ms: 30_000,
        }
    }
}

impl LoaderSection {
    pub fn to_loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            max_parallel_loads: self.max_parallel_loads,
            backend_load_timeout: ms(self.backend_load_timeout_ms),
            backoff_base: ms(self.backoff_base_ms),
            backoff_max: ms(self.backoff_max_ms),
            max_retries: self.max_retries,
            failed_ttl: ms(self.failed_ttl_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionSection {
    pub interval_ms: u64,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub idle_unload_after_ms: Option<u64>,
    pub drift_tolerance_bytes: u64,
}

impl Default for EvictionSection {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            high_watermark: 0.9,
            low_watermark: 0.75,
            idle_unload_after_ms: None,
            drift_tolerance_bytes: 256 * 1024 * 1024,
        }
    }
}

impl EvictionSection {
    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: ms(self.interval_ms),
            high_watermark: self.high_watermark,
            low_watermark: self.low_watermark,
            idle_unload_after: self.idle_unload_after_ms.map(ms),
            drift_tolerance_bytes: self.drift_tolerance_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEntry {
    pub topic: String,
    pub models: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreloaderSection {
    pub confidence_threshold: f64,
    pub load_timeout_ms: u64,
    pub topics: Vec<TopicEntry>,
}

impl Default for PreloaderSection {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            load_timeout_ms: 5_000,
            topics: Vec::new(),
        }
    }
}

impl PreloaderSection {
    pub fn to_preloader_config(&self) -> PreloaderConfig {
        let topics: HashMap<String, Vec<ModelId>> = self
            .topics
            .iter()
            .map(|t| {
                let models = t.models.iter().map(|m| ModelId::from(m.as_str())).collect();
                (t.topic.clone(), models)
            })
            .collect();
        PreloaderConfig {
            confidence_threshold: self.confidence_threshold,
            load_timeout: ms(self.load_timeout_ms),
            topics,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherKind {
    /// Spawn `program` from each agent's catalog entry.
    #[default]
    Command,
    /// In-process stand-ins that heartbeat on a timer.
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub launcher: LauncherKind,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub per_agent_floor_ms: u64,
    pub restart_base_ms: u64,
    pub restart_max_ms: u64,
    pub max_restarts: u32,
    pub restart_jitter: f64,
    pub stable_after_ms: u64,
    /// Startup latency of simulated agents.
    pub simulated_startup_ms: u64,
    pub catalog: Vec<AgentEntry>,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            launcher: LauncherKind::Command,
            heartbeat_interval_ms: 5_000,
            poll_interval_ms: 1_000,
            per_agent_floor_ms: 2_000,
            restart_base_ms: 1_000,
            restart_max_ms: 30_000,
            max_restarts: 3,
            restart_jitter: 0.1,
            stable_after_ms: 300_000,
            simulated_startup_ms: 50,
            catalog: Vec::new(),
        }
    }
}

impl AgentsSection {
    pub fn to_activation_config(&self) -> ActivationConfig {
        ActivationConfig {
            per_agent_floor: ms(self.per_agent_floor_ms),
        }
    }

    pub fn to_supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: ms(self.heartbeat_interval_ms),
            poll_interval: ms(self.poll_interval_ms),
            policy: RestartPolicy {
                base_backoff: ms(self.restart_base_ms),
                max_backoff: ms(self.restart_max_ms),
                max_restarts: self.max_restarts,
                jitter: self.restart_jitter,
                stable_after: ms(self.stable_after_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_startup_deadline_ms")]
    pub startup_deadline_ms: u64,
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_startup_deadline_ms() -> u64 {
    30_000
}

impl AgentEntry {
    pub fn to_descriptor(&self) -> AgentDescriptor {
        let deps: Vec<&str> = self.dependencies.iter().map(String::as_str).collect();
        let mut descriptor = AgentDescriptor::new(&self.id)
            .depends_on(&deps)
            .with_startup_deadline(ms(self.startup_deadline_ms));
        if let Some(program) = &self.program {
            descriptor = descriptor.with_launch(LaunchSpec {
                program: program.clone(),
                args: self.args.clone(),
                env: self.env.clone(),
            });
        }
        descriptor
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub heavy_threshold: f64,
    pub default_complexity: f64,
    pub local_backend: String,
    pub heavy_backend: String,
    pub failover_backend: Option<String>,
    pub decision_ttl_ms: u64,
    pub payload_boost_threshold_bytes: u64,
    pub payload_boost: f64,
    pub rules: Vec<RoutingRuleConfig>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            heavy_threshold: 0.8,
            default_complexity: 0.3,
            local_backend: "local-gpu".into(),
            heavy_backend: "remote".into(),
            failover_backend: None,
            decision_ttl_ms: 300_000,
            payload_boost_threshold_bytes: 1024 * 1024,
            payload_boost: 0.2,
            rules: Vec::new(),
        }
    }
}

impl RoutingSection {
    pub fn to_router_config(&self) -> RouterConfig {
        RouterConfig {
            heavy_threshold: self.heavy_threshold,
            local_backend: self.local_backend.clone(),
            heavy_backend: self.heavy_backend.clone(),
            failover_backend: self.failover_backend.clone(),
            decision_ttl: ms(self.decision_ttl_ms),
        }
    }

    pub fn payload(&self) -> PayloadBoost {
        PayloadBoost {
            threshold_bytes: self.payload_boost_threshold_bytes,
            boost: self.payload_boost,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub window_ms: u64,
    pub recovery_timeout_ms: u64,
    pub max_recovery_timeout_ms: u64,
    pub probe_budget: u32,
    pub successes_to_close: u32,
    pub retention_ms: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            recovery_timeout_ms: 30_000,
            max_recovery_timeout_ms: 300_000,
            probe_budget: 3,
            successes_to_close: 2,
            retention_ms: 600_000,
        }
    }
}

impl BreakerSection {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            window: ms(self.window_ms),
            recovery_timeout: ms(self.recovery_timeout_ms),
            max_recovery_timeout: ms(self.max_recovery_timeout_ms),
            probe_budget: self.probe_budget,
            successes_to_close: self.successes_to_close,
            retention: ms(self.retention_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_ms: u64,
    /// Period of breaker and decision-record garbage collection.
    pub gc_interval_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            gc_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSection {
    pub socket_path: String,
    pub max_connections: usize,
}

impl Default for IpcSection {
    fn default() -> Self {
        Self {
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            max_connections: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub size_bytes: u64,
    pub backend: BackendKind,
    #[serde(default)]
    pub load_cost_ms: u64,
    /// Never evicted.
    #[serde(default, alias = "required")]
    pub pinned: bool,
}

impl ModelEntry {
    pub fn to_descriptor(&self) -> ModelDescriptor {
        ModelDescriptor::new(&self.name, &self.version, self.size_bytes, self.backend)
            .with_load_cost_ms(self.load_cost_ms)
            .pinned(self.pinned)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendDriver {
    /// In-process backend with configurable latency and failure rates.
    #[default]
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEntry {
    pub id: String,
    pub kind: BackendKind,
    #[serde(default)]
    pub driver: BackendDriver,
    #[serde(default)]
    pub load_latency_scale: f64,
    #[serde(default)]
    pub invoke_latency_ms: u64,
    #[serde(default)]
    pub load_failure_rate: f64,
    #[serde(default)]
    pub invoke_failure_rate: f64,
}

impl BackendEntry {
    pub fn simulated_config(&self) -> SimulatedBackendConfig {
        SimulatedBackendConfig {
            load_latency_scale: self.load_latency_scale,
            invoke_latency: ms(self.invoke_latency_ms),
            load_failure_rate: self.load_failure_rate,
            invoke_failure_rate: self.invoke_failure_rate,
        }
    }
}
