//! VRAM Monitor - periodic pressure relief and idle unload.
//!
//! Runs on its own timer. Each sweep compares ledger usage with the
//! watermarks, unloads models idle past the configured threshold, and
//! samples the device (when a probe is present) to log accounting drift.
//! The ledger stays the only source of truth; probe readings never feed
//! back into it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::eviction::{eviction_order, select_idle, EvictionCandidate};
use crate::models::{ModelId, ModelLoader, ModelState};

#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    #[error("Device query failed: {0}")]
    QueryFailed(String),
}

/// Reads real accelerator memory usage.
#[async_trait]
pub trait DeviceProbe: Send + Sync {
    async fn used_bytes(&self) -> Result<u64, ProbeError>;
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Start evicting above this fraction of capacity.
    pub high_watermark: f64,
    /// Evict down to this fraction.
    pub low_watermark: f64,
    /// Unload models unused for this long. `None` disables idle unload.
    pub idle_unload_after: Option<Duration>,
    pub drift_tolerance_bytes: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            high_watermark: 0.9,
            low_watermark: 0.75,
            idle_unload_after: None,
            drift_tolerance_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub evicted: Vec<ModelId>,
    /// Candidates whose eviction was deferred.
    pub deferred: usize,
    /// Device reading minus ledger usage, when a probe answered.
    pub drift_bytes: Option<i64>,
}

pub struct VramMonitor {
    loader: ModelLoader,
    probe: Option<Arc<dyn DeviceProbe>>,
    config: MonitorConfig,
}

impl VramMonitor {
    pub fn new(loader: ModelLoader, config: MonitorConfig) -> Self {
        Self {
            loader,
            probe: None,
            config,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "VRAM monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.evicted.is_empty() {
                        tracing::info!(evicted = report.evicted.len(), deferred = report.deferred, "VRAM sweep");
                    }
                }
            }
        }
        tracing::info!("VRAM monitor stopped");
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport {
            drift_bytes: self.check_drift().await,
            ..Default::default()
        };

        if let Some(idle_for) = self.config.idle_unload_after {
            let idle = select_idle(&self.loader.candidates(), Instant::now(), idle_for);
            for model in idle {
                self.evict_into(&model, &mut report).await;
            }
        }

        self.relieve_pressure(&mut report).await;
        self.publish_gauges();
        report
    }

    async fn relieve_pressure(&self, report: &mut SweepReport) {
        let ledger = self.loader.ledger();
        let capacity = ledger.capacity();
        if capacity == 0 {
            return;
        }
        let high = (capacity as f64 * self.config.high_watermark) as u64;
        if ledger.in_use_bytes() <= high {
            return;
        }
        let target = (capacity as f64 * self.config.low_watermark) as u64;
        tracing::warn!(
            in_use = ledger.in_use_bytes(),
            capacity,
            target,
            "VRAM above high watermark"
        );

        let mut eligible: Vec<EvictionCandidate> = self
            .loader
            .candidates()
            .into_iter()
            .filter(|c| c.is_evictable() && c.bytes > 0)
            .collect();
        eligible.sort_by(eviction_order);

        for candidate in eligible {
            if ledger.in_use_bytes() <= target {
                break;
            }
            self.evict_into(&candidate.id, report).await;
        }
    }

    async fn evict_into(&self, model: &ModelId, report: &mut SweepReport) {
        if self.loader.evict(model).await {
            report.evicted.push(model.clone());
        } else {
            report.deferred += 1;
        }
    }

    async fn check_drift(&self) -> Option<i64> {
        let probe = self.probe.as_ref()?;
        let device = match probe.used_bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!(error = %e, "device probe failed");
                return None;
            }
        };
        let ledger = self.loader.ledger().in_use_bytes();
        let drift = device as i64 - ledger as i64;
        if drift.unsigned_abs() > self.config.drift_tolerance_bytes {
            tracing::warn!(device, ledger, drift, "device usage drifts from ledger");
        }
        Some(drift)
    }

    fn publish_gauges(&self) {
        let budget = self.loader.ledger().snapshot();
        let resident = self
            .loader
            .registry()
            .snapshot()
            .iter()
            .filter(|d| d.state == ModelState::Resident)
            .count();
        metrics::gauge!("orchestrator_vram_used_bytes").set(budget.used_bytes as f64);
        metrics::gauge!("orchestrator_vram_pending_bytes").set(budget.pending_bytes as f64);
        metrics::gauge!("orchestrator_resident_models").set(resident as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vram_ledger::VramLedger;
    use crate::models::{
        BackendKind, BackendSet, LoaderConfig, ModelDescriptor, ModelRegistry, SimulatedBackend,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn loader(capacity: u64, sizes: &[(&str, u64)]) -> ModelLoader {
        let registry = ModelRegistry::from_catalog(
            sizes
                .iter()
                .map(|(n, b)| ModelDescriptor::new(n, "", *b, BackendKind::LocalGpu)),
        )
        .unwrap();
        ModelLoader::new(
            Arc::new(registry),
            Arc::new(VramLedger::new(capacity, 0).unwrap()),
            BackendSet::new().with(Arc::new(SimulatedBackend::new("gpu0", BackendKind::LocalGpu))),
            LoaderConfig::default(),
        )
    }

    struct FixedProbe(u64);

    #[async_trait]
    impl DeviceProbe for FixedProbe {
        async fn used_bytes(&self) -> Result<u64, ProbeError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_evicts_down_to_low_watermark() {
        let loader = loader(1000, &[("a", 400), ("b", 300), ("c", 250)]);
        for m in ["a", "b", "c"] {
            loader.load(&ModelId::from(m), WAIT).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(loader.ledger().in_use_bytes(), 950);

        let monitor = VramMonitor::new(loader.clone(), MonitorConfig::default());
        let report = monitor.sweep().await;

        assert_eq!(report.evicted, vec![ModelId::from("a")]);
        assert!(loader.ledger().in_use_bytes() <= 750);
    }

    #[tokio::test]
    async fn test_below_high_watermark_is_left_alone() {
        let loader = loader(1000, &[("a", 400), ("b", 300)]);
        loader.load(&ModelId::from("a"), WAIT).await.unwrap();
        loader.load(&ModelId::from("b"), WAIT).await.unwrap();

        let monitor = VramMonitor::new(loader.clone(), MonitorConfig::default());
        assert!(monitor.sweep().await.evicted.is_empty());
    }

    #[tokio::test]
    async fn test_idle_models_unloaded() {
        let loader = loader(1000, &[("a", 100)]);
        loader.load(&ModelId::from("a"), WAIT).await.unwrap();

        let config = MonitorConfig {
            idle_unload_after: Some(Duration::ZERO),
            ..Default::default()
        };
        let monitor = VramMonitor::new(loader.clone(), config);
        let report = monitor.sweep().await;

        assert_eq!(report.evicted, vec![ModelId::from("a")]);
        assert_eq!(loader.ledger().in_use_bytes(), 0);
    }

    #[tokio::test]
    async fn test_busy_model_deferred_not_forced() {
        let loader = loader(1000, &[("a", 100)]);
        loader.load(&ModelId::from("a"), WAIT).await.unwrap();
        let _lease = loader.registry().lease(&ModelId::from("a")).unwrap();

        let config = MonitorConfig {
            idle_unload_after: Some(Duration::ZERO),
            ..Default::default()
        };
        let report = VramMonitor::new(loader.clone(), config).sweep().await;
        assert!(report.evicted.is_empty());
        assert_eq!(loader.registry().state(&ModelId::from("a")), Some(ModelState::Resident));
    }

    #[tokio::test]
    async fn test_drift_reported_not_applied() {
        let loader = loader(1000, &[("a", 100)]);
        loader.load(&ModelId::from("a"), WAIT).await.unwrap();

        let monitor = VramMonitor::new(loader.clone(), MonitorConfig::default())
            .with_probe(Arc::new(FixedProbe(600)));
        let report = monitor.sweep().await;

        assert_eq!(report.drift_bytes, Some(500));
        assert_eq!(loader.ledger().in_use_bytes(), 100);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let loader = loader(1000, &[]);
        let cancel = CancellationToken::new();
        let config = MonitorConfig {
            interval: Duration::from_millis(5),
            ..Default::default()
        };
        let task = tokio::spawn(VramMonitor::new(loader, config).run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}
