//! Types and configuration for the model loader.
//!
//! Extracted from `loader.rs` for readability.

use std::time::Duration;

use thiserror::Error;

use super::backend::BackendKind;
use super::registry_types::{ModelId, ModelState};

/// Who asked for a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPriority {
    /// A task needs the model now.
    Demand,
    /// Warming ahead of demand; first to be evicted.
    Predictive,
}

/// Loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Max concurrent physical loads across all models.
    pub max_parallel_loads: usize,
    /// Upper bound on a single backend load call.
    pub backend_load_timeout: Duration,
    /// Backoff after the first consecutive failure; doubled per failure.
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failures before the model is parked for `failed_ttl`.
    pub max_retries: u32,
    pub failed_ttl: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_parallel_loads: 2,
            backend_load_timeout: Duration::from_secs(120),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            max_retries: 3,
            failed_ttl: Duration::from_secs(300),
        }
    }
}

impl LoaderConfig {
    /// Time a model stays ineligible after its `failures`-th consecutive
    /// failure.
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        if failures >= self.max_retries {
            return self.failed_ttl;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Loader metrics.
#[derive(Debug, Default, Clone)]
pub struct LoaderMetrics {
    pub total_loads: u64,
    pub cache_hits: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub evictions_deferred: u64,
    pub predictive_loads: u64,
    /// Predictive loads that failed; these never trigger backoff.
    pub predictive_failures: u64,
    /// Demand requests served by a predictively loaded model.
    pub predictions_hit: u64,
    pub avg_load_ms: f64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Model not found: {0}")]
    NotFound(ModelId),

    #[error("Insufficient VRAM for {model}: requested {requested} bytes, at most {reclaimable} reclaimable")]
    InsufficientVram {
        model: ModelId,
        requested: u64,
        reclaimable: u64,
    },

    #[error("Load failed for {model}: {reason}")]
    LoadFailed { model: ModelId, reason: String },

    #[error("Model {model} failed recently; retry in {retry_in_ms} ms")]
    BackoffActive { model: ModelId, retry_in_ms: u64 },

    #[error("Deadline exceeded waiting for {0}")]
    DeadlineExceeded(ModelId),

    #[error("Model {model} has {in_flight} in-flight requests")]
    InUse { model: ModelId, in_flight: usize },

    #[error("Model {model} is not resident (state {state})")]
    NotResident { model: ModelId, state: ModelState },

    #[error("No backend configured for {kind} (model {model})")]
    NoBackend { model: ModelId, kind: BackendKind },

    #[error("Unload failed for {model}: {reason}")]
    UnloadFailed { model: ModelId, reason: String },
}

impl LoadError {
    /// Errors worth retrying later without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LoadError::LoadFailed { .. }
                | LoadError::BackoffActive { .. }
                | LoadError::DeadlineExceeded(_)
        )
    }
}
