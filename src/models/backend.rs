//! Backend capability contract for model hosting.
//!
//! Every backend kind (local GPU, local CPU, remote) supplies one
//! implementation of [`ModelBackend`]. The loader only ever talks to this
//! trait; routing only ever talks to backends by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::registry_types::{ModelDescriptor, ModelHandle, ModelId};
use crate::routing::TaskRequest;

/// Where a model or task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    LocalGpu,
    LocalCpu,
    Remote,
}

impl BackendKind {
    /// Only accelerator-resident models are charged to the VRAM ledger.
    pub fn consumes_vram(&self) -> bool {
        matches!(self, BackendKind::LocalGpu)
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, BackendKind::Remote)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::LocalGpu => "local-gpu",
            BackendKind::LocalCpu => "local-cpu",
            BackendKind::Remote => "remote",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    #[error("Backend crashed: {0}")]
    Crashed(String),

    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Backend timed out after {0} ms")]
    Timeout(u64),
}

/// Result of executing a task on a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOutput {
    pub backend_id: String,
    pub elapsed_ms: u64,
    pub result_ref: Option<String>,
}

/// Load / Unload / Invoke contract implemented once per backend kind.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// Bring a model into memory and return its handle.
    async fn load(&self, model: &ModelDescriptor) -> Result<ModelHandle, BackendError>;

    async fn unload(&self, model: &ModelId, handle: ModelHandle) -> Result<(), BackendError>;

    /// Execute a task. `handle` is set when the task needs a resident model.
    async fn invoke(
        &self,
        task: &TaskRequest,
        handle: Option<ModelHandle>,
    ) -> Result<InvokeOutput, BackendError>;
}

/// Backends keyed by id. Built once at startup.
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: HashMap<String, Arc<dyn ModelBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.insert(backend);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(id).cloned()
    }

    /// The backend hosting models of `kind`. Lowest id wins when several
    /// backends share a kind, so the choice is stable.
    pub fn for_kind(&self, kind: BackendKind) -> Option<Arc<dyn ModelBackend>> {
        self.backends
            .iter()
            .filter(|(_, b)| b.kind() == kind)
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(_, b)| b.clone())
    }

    pub fn kind_of(&self, id: &str) -> Option<BackendKind> {
        self.backends.get(id).map(|b| b.kind())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

/// Tunables for [`SimulatedBackend`].
#[derive(Debug, Clone)]
pub struct SimulatedBackendConfig {
    /// Fraction of `load_cost_ms` actually slept (0 disables load latency).
    pub load_latency_scale: f64,
    pub invoke_latency: Duration,
    /// Probability of a load failing (0.0 to 1.0).
    pub load_failure_rate: f64,
    /// Probability of an invoke failing (0.0 to 1.0).
    pub invoke_failure_rate: f64,
}

impl Default for SimulatedBackendConfig {
    fn default() -> Self {
        Self {
            load_latency_scale: 0.0,
            invoke_latency: Duration::ZERO,
            load_failure_rate: 0.0,
            invoke_failure_rate: 0.0,
        }
    }
}

/// In-process backend that models load latency and failures without real
/// hardware. Used for `serve --simulate` and as the default in tests.
pub struct SimulatedBackend {
    id: String,
    kind: BackendKind,
    config: SimulatedBackendConfig,
    next_handle: AtomicU64,
    loads: AtomicU64,
    unloads: AtomicU64,
    invocations: AtomicU64,
}

impl SimulatedBackend {
    pub fn new(id: &str, kind: BackendKind) -> Self {
        Self::with_config(id, kind, SimulatedBackendConfig::default())
    }

    pub fn with_config(id: &str, kind: BackendKind, config: SimulatedBackendConfig) -> Self {
        Self {
            id: id.to_string(),
            kind,
            config,
            next_handle: AtomicU64::new(1),
            loads: AtomicU64::new(0),
            unloads: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_count(&self) -> u64 {
        self.unloads.load(Ordering::SeqCst)
    }

    pub fn invoke_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn roll(rate: f64) -> bool {
        rate > 0.0 && rand::thread_rng().gen_bool(rate.clamp(0.0, 1.0))
    }
}

#[async_trait]
impl ModelBackend for SimulatedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn load(&self, model: &ModelDescriptor) -> Result<ModelHandle, BackendError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let latency_ms = (model.load_cost_ms as f64 * self.config.load_latency_scale) as u64;
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
        if Self::roll(self.config.load_failure_rate) {
            return Err(BackendError::Crashed(format!("simulated load failure for {}", model.id)));
        }
        Ok(ModelHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn unload(&self, _model: &ModelId, _handle: ModelHandle) -> Result<(), BackendError> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(
        &self,
        task: &TaskRequest,
        _handle: Option<ModelHandle>,
    ) -> Result<InvokeOutput, BackendError> {
        let start = Instant::now();
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if !self.config.invoke_latency.is_zero() {
            tokio::time::sleep(self.config.invoke_latency).await;
        }
        if Self::roll(self.config.invoke_failure_rate) {
            return Err(BackendError::Unreachable(format!("simulated failure for {}", task.id)));
        }
        Ok(InvokeOutput {
            backend_id: self.id.clone(),
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            result_ref: Some(format!("{}/{}", self.id, task.id)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_local_gpu_consumes_vram() {
        assert!(BackendKind::LocalGpu.consumes_vram());
        assert!(!BackendKind::LocalCpu.consumes_vram());
        assert!(!BackendKind::Remote.consumes_vram());
        assert!(BackendKind::LocalCpu.is_local());
        assert!(!BackendKind::Remote.is_local());
    }

    #[test]
    fn backend_kind_serde_names() {
        let kind: BackendKind = serde_json::from_str("\"local-gpu\"").unwrap();
        assert_eq!(kind, BackendKind::LocalGpu);
        assert_eq!(serde_json::to_string(&BackendKind::Remote).unwrap(), "\"remote\"");
    }

    #[test]
    fn backend_set_kind_lookup_is_stable() {
        let set = BackendSet::new()
            .with(Arc::new(SimulatedBackend::new("gpu-b", BackendKind::LocalGpu)))
            .with(Arc::new(SimulatedBackend::new("gpu-a", BackendKind::LocalGpu)))
            .with(Arc::new(SimulatedBackend::new("cloud", BackendKind::Remote)));

        assert_eq!(set.for_kind(BackendKind::LocalGpu).unwrap().id(), "gpu-a");
        assert!(set.for_kind(BackendKind::LocalCpu).is_none());
        assert_eq!(set.kind_of("cloud"), Some(BackendKind::Remote));
        assert_eq!(set.ids(), vec!["cloud", "gpu-a", "gpu-b"]);
    }

    #[tokio::test]
    async fn simulated_backend_issues_distinct_handles() {
        let backend = SimulatedBackend::new("gpu", BackendKind::LocalGpu);
        let model = ModelDescriptor::new("m", "", 10, BackendKind::LocalGpu);
        let a = backend.load(&model).await.unwrap();
        let b = backend.load(&model).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(backend.load_count(), 2);
    }
}
