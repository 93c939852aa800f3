//! Model Loader - VRAM-aware, single-flight model loading.
//!
//! A load runs as its own task so that a caller giving up on its deadline
//! never aborts the physical load; the next caller picks up the result.
//! Concurrent callers for the same model share one load through a watch
//! channel. Physical loads across models are bounded by a semaphore.
//!
//! A demand caller that joins a predictive load upgrades it: the load task
//! re-reads the waiting priority before reserving and before choosing what
//! it may evict. Predictive failures never put the model into backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};

use super::backend::BackendSet;
pub use super::loader_types::*;
use super::registry::{
    EvictionRefusal, ModelDescriptor, ModelHandle, ModelId, ModelLease, ModelRegistry, ModelSlot,
    ModelState,
};
use crate::memory::eviction::{select_victims, EvictionCandidate, EvictionScope};
use crate::memory::vram_ledger::{LedgerError, ReservationToken, VramLedger};

type LoadOutcome = Result<ModelHandle, LoadError>;

/// Result of one physical load and the priority it actually ran at.
#[derive(Clone)]
struct Settled {
    priority: LoadPriority,
    outcome: LoadOutcome,
}

#[derive(Clone)]
struct InflightLoad {
    rx: watch::Receiver<Option<Settled>>,
    /// Set once any demand caller waits on this load.
    demand: Arc<AtomicBool>,
}

struct LoaderInner {
    registry: Arc<ModelRegistry>,
    ledger: Arc<VramLedger>,
    backends: BackendSet,
    config: LoaderConfig,
    gate: Semaphore,
    inflight: DashMap<ModelId, InflightLoad>,
    metrics: Mutex<LoaderMetrics>,
}

/// Loads and unloads models against the ledger and registry.
#[derive(Clone)]
pub struct ModelLoader {
    inner: Arc<LoaderInner>,
}

impl ModelLoader {
    pub fn new(
        registry: Arc<ModelRegistry>,
        ledger: Arc<VramLedger>,
        backends: BackendSet,
        config: LoaderConfig,
    ) -> Self {
        let permits = config.max_parallel_loads.max(1);
        Self {
            inner: Arc::new(LoaderInner {
                registry,
                ledger,
                backends,
                config,
                gate: Semaphore::new(permits),
                inflight: DashMap::new(),
                metrics: Mutex::new(LoaderMetrics::default()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &Arc<VramLedger> {
        &self.inner.ledger
    }

    pub fn backends(&self) -> &BackendSet {
        &self.inner.backends
    }

    pub fn metrics(&self) -> LoaderMetrics {
        self.inner.metrics.lock().clone()
    }

    /// Ensure `model` is resident, waiting at most `timeout`.
    pub async fn load(&self, model: &ModelId, timeout: Duration) -> Result<ModelHandle, LoadError> {
        self.load_until(model, tokio::time::Instant::now() + timeout, LoadPriority::Demand)
            .await
    }

    /// Best-effort warm load; evictable before any demand-loaded model.
    pub async fn load_predictive(
        &self,
        model: &ModelId,
        timeout: Duration,
    ) -> Result<ModelHandle, LoadError> {
        self.load_until(model, tokio::time::Instant::now() + timeout, LoadPriority::Predictive)
            .await
    }

    /// Take a lease and make sure the model is resident. The lease is taken
    /// first so the model cannot be evicted between load and use.
    pub async fn acquire(
        &self,
        model: &ModelId,
        deadline: tokio::time::Instant,
    ) -> Result<(ModelLease, ModelHandle), LoadError> {
        let lease = self
            .inner
            .registry
            .lease(model)
            .map_err(|_| LoadError::NotFound(model.clone()))?;
        let handle = self.load_until(model, deadline, LoadPriority::Demand).await?;
        Ok((lease, handle))
    }

    pub async fn load_until(
        &self,
        model: &ModelId,
        deadline: tokio::time::Instant,
        priority: LoadPriority,
    ) -> Result<ModelHandle, LoadError> {
        let slot = self
            .inner
            .registry
            .slot(model)
            .ok_or_else(|| LoadError::NotFound(model.clone()))?;

        if let Some(handle) = self.inner.resident_handle(model, &slot, priority) {
            return Ok(handle);
        }

        let mut settled = self.wait_settled(model, slot.clone(), priority, deadline).await?;

        // A demand caller that joined after a predictive load had already
        // reserved gets one load of its own with demand eviction rights.
        if priority == LoadPriority::Demand
            && settled.priority == LoadPriority::Predictive
            && matches!(
                settled.outcome,
                Err(LoadError::InsufficientVram { .. }) | Err(LoadError::LoadFailed { .. })
            )
        {
            tracing::debug!(model = %model, "retrying predictive outcome as demand load");
            settled = self.wait_settled(model, slot, priority, deadline).await?;
        }

        let handle = settled.outcome?;
        if priority == LoadPriority::Demand && self.inner.ledger.promote(model) {
            self.inner.metrics.lock().predictions_hit += 1;
        }
        Ok(handle)
    }

    async fn wait_settled(
        &self,
        model: &ModelId,
        slot: Arc<ModelSlot>,
        priority: LoadPriority,
        deadline: tokio::time::Instant,
    ) -> Result<Settled, LoadError> {
        let mut rx = self.join_or_start(model, slot, priority)?;
        let result = match tokio::time::timeout_at(deadline, rx.wait_for(Option::is_some)).await {
            Ok(Ok(value)) => value.clone().ok_or_else(|| LoadError::LoadFailed {
                model: model.clone(),
                reason: "load task ended without a result".into(),
            }),
            Ok(Err(_)) => Err(LoadError::LoadFailed {
                model: model.clone(),
                reason: "load task ended without a result".into(),
            }),
            Err(_) => {
                tracing::debug!(model = %model, "caller deadline passed; load continues in background");
                Err(LoadError::DeadlineExceeded(model.clone()))
            }
        };
        result
    }

    /// Join the in-flight load for `model` or start one.
    fn join_or_start(
        &self,
        model: &ModelId,
        slot: Arc<ModelSlot>,
        priority: LoadPriority,
    ) -> Result<watch::Receiver<Option<Settled>>, LoadError> {
        match self.inner.inflight.entry(model.clone()) {
            Entry::Occupied(existing) => {
                let load = existing.get();
                if priority == LoadPriority::Demand && !load.demand.swap(true, Ordering::AcqRel) {
                    tracing::debug!(model = %model, "demand caller upgraded predictive load");
                }
                Ok(load.rx.clone())
            }
            Entry::Vacant(vacant) => {
                self.inner.check_retry_eligible(model, &slot)?;

                let (tx, rx) = watch::channel(None);
                let demand = Arc::new(AtomicBool::new(priority == LoadPriority::Demand));
                vacant.insert(InflightLoad {
                    rx: rx.clone(),
                    demand: demand.clone(),
                });

                let inner = self.inner.clone();
                let model = model.clone();
                tokio::spawn(async move {
                    let settled = inner.physical_load(&model, &slot, &demand).await;
                    // Later callers must observe the new state, not this result.
                    inner.inflight.remove(&model);
                    let _ = tx.send(Some(settled));
                });
                Ok(rx)
            }
        }
    }

    /// Explicit unload. Permitted only with zero in-flight references;
    /// pinned models may be unloaded this way.
    pub async fn unload(&self, model: &ModelId) -> Result<(), LoadError> {
        let slot = self
            .inner
            .registry
            .slot(model)
            .ok_or_else(|| LoadError::NotFound(model.clone()))?;
        let _transition = slot.transition.lock().await;
        match self.inner.registry.begin_eviction(&slot, true) {
            Ok((_, handle)) => self.inner.finish_unload(model, &slot, handle).await,
            Err(EvictionRefusal::InUse(in_flight)) => Err(LoadError::InUse {
                model: model.clone(),
                in_flight,
            }),
            Err(EvictionRefusal::NotResident(state)) => Err(LoadError::NotResident {
                model: model.clone(),
                state,
            }),
            Err(EvictionRefusal::Pinned) => Err(LoadError::UnloadFailed {
                model: model.clone(),
                reason: "model is pinned".into(),
            }),
        }
    }

    /// Evict one model if it is idle. Returns false when the eviction was
    /// deferred (busy, pinned, mid-transition or not resident).
    pub async fn evict(&self, model: &ModelId) -> bool {
        self.inner.evict(model).await
    }

    /// Clear a persisted `Failed` state so the model can be loaded again.
    pub async fn reset(&self, model: &ModelId) -> Result<(), LoadError> {
        let slot = self
            .inner
            .registry
            .slot(model)
            .ok_or_else(|| LoadError::NotFound(model.clone()))?;
        let _transition = slot.transition.lock().await;
        let state = slot.read(|d| d.state);
        if state != ModelState::Failed {
            return Ok(());
        }
        slot.update(|d| {
            d.consecutive_failures = 0;
            d.retry_after = None;
        });
        self.inner
            .registry
            .transition(&slot, ModelState::Unloaded)
            .map_err(|e| LoadError::LoadFailed {
                model: model.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(model = %model, "failed state reset");
        Ok(())
    }

    /// Eviction view of every catalogued model.
    pub fn candidates(&self) -> Vec<EvictionCandidate> {
        self.inner.candidates(None)
    }
}

impl LoaderInner {
    fn resident_handle(
        &self,
        model: &ModelId,
        slot: &ModelSlot,
        priority: LoadPriority,
    ) -> Option<ModelHandle> {
        let handle = slot.update(|d| {
            if d.state == ModelState::Resident {
                d.last_used_at = Some(Instant::now());
                d.handle
            } else {
                None
            }
        })?;

        let promoted = priority == LoadPriority::Demand && self.ledger.promote(model);
        let mut metrics = self.metrics.lock();
        metrics.cache_hits += 1;
        if promoted {
            metrics.predictions_hit += 1;
        }
        Some(handle)
    }

    fn check_retry_eligible(&self, model: &ModelId, slot: &ModelSlot) -> Result<(), LoadError> {
        let retry_after = slot.read(|d| {
            if d.state == ModelState::Failed {
                d.retry_after
            } else {
                None
            }
        });
        match retry_after {
            Some(at) if at > Instant::now() => Err(LoadError::BackoffActive {
                model: model.clone(),
                retry_in_ms: u64::try_from(at.saturating_duration_since(Instant::now()).as_millis())
                    .unwrap_or(u64::MAX),
            }),
            _ => Ok(()),
        }
    }

    async fn physical_load(&self, model: &ModelId, slot: &ModelSlot, demand: &AtomicBool) -> Settled {
        let settle = |outcome: LoadOutcome| Settled {
            priority: priority_of(demand),
            outcome,
        };
        let _transition = slot.transition.lock().await;

        let descriptor = slot.read(|d| d.clone());
        if descriptor.state == ModelState::Resident {
            if let Some(handle) = descriptor.handle {
                return settle(Ok(handle));
            }
        }

        let Some(backend) = self.backends.for_kind(descriptor.backend_kind) else {
            return settle(Err(LoadError::NoBackend {
                model: model.clone(),
                kind: descriptor.backend_kind,
            }));
        };

        let Ok(_permit) = self.gate.acquire().await else {
            return settle(Err(LoadError::LoadFailed {
                model: model.clone(),
                reason: "loader gate closed".into(),
            }));
        };

        let (token, priority) = if descriptor.backend_kind.consumes_vram() {
            match self.reserve_with_eviction(&descriptor, demand).await {
                Ok((token, priority)) => (Some(token), priority),
                Err((e, priority)) => return Settled { priority, outcome: Err(e) },
            }
        } else {
            (None, priority_of(demand))
        };

        if let Err(e) = self.registry.transition(slot, ModelState::Loading) {
            if let Some(token) = token {
                let _ = self.ledger.rollback(token);
            }
            return Settled {
                priority,
                outcome: Err(LoadError::LoadFailed {
                    model: model.clone(),
                    reason: e.to_string(),
                }),
            };
        }

        let start = Instant::now();
        let result =
            tokio::time::timeout(self.config.backend_load_timeout, backend.load(&descriptor)).await;
        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let failure = match result {
            Ok(Ok(handle)) => {
                if let Some(token) = token {
                    if let Err(e) = self.ledger.commit(token) {
                        tracing::error!(model = %model, error = %e, "ledger commit failed");
                    }
                }
                slot.update(|d| {
                    d.handle = Some(handle);
                    d.last_used_at = Some(Instant::now());
                    d.consecutive_failures = 0;
                    d.retry_after = None;
                });
                let _ = self.registry.transition(slot, ModelState::Resident);
                self.record_load(elapsed_ms, priority);
                tracing::info!(
                    model = %model,
                    backend = backend.id(),
                    bytes = descriptor.vram_bytes(),
                    elapsed_ms,
                    predictive = priority == LoadPriority::Predictive,
                    "model resident"
                );
                return Settled {
                    priority,
                    outcome: Ok(handle),
                };
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "backend load exceeded {} ms",
                self.config.backend_load_timeout.as_millis()
            ),
        };

        if let Some(token) = token {
            let _ = self.ledger.rollback(token);
        }
        let error = LoadError::LoadFailed {
            model: model.clone(),
            reason: failure,
        };

        // A demand caller waiting on this load makes the failure its own.
        let priority = priority_of(demand);
        if priority == LoadPriority::Predictive {
            // Dropped without backoff; the next demand load calls the backend.
            slot.update(|d| d.handle = None);
            let _ = self.registry.transition(slot, descriptor.state);
            self.metrics.lock().predictive_failures += 1;
            metrics::counter!("orchestrator_predictive_failures_total").increment(1);
            tracing::debug!(model = %model, error = %error, "predictive load failed");
            return Settled {
                priority,
                outcome: Err(error),
            };
        }

        let failures = slot.update(|d| {
            d.consecutive_failures += 1;
            d.handle = None;
            d.retry_after = Some(Instant::now() + self.config.backoff_for(d.consecutive_failures));
            d.consecutive_failures
        });
        let _ = self.registry.transition(slot, ModelState::Failed);
        self.metrics.lock().load_failures += 1;
        metrics::counter!("orchestrator_load_failures_total").increment(1);
        tracing::warn!(
            model = %model,
            failures,
            backoff_ms = self.config.backoff_for(failures).as_millis() as u64,
            error = %error,
            "model load failed"
        );
        Settled {
            priority,
            outcome: Err(error),
        }
    }

    /// Reserve VRAM, evicting idle models once if the first attempt fails.
    /// The waiting priority is re-read before each step so a demand caller
    /// that joins mid-way widens the eviction scope.
    async fn reserve_with_eviction(
        &self,
        descriptor: &ModelDescriptor,
        demand: &AtomicBool,
    ) -> Result<(ReservationToken, LoadPriority), (LoadError, LoadPriority)> {
        let model = &descriptor.id;
        let bytes = descriptor.vram_bytes();

        let priority = priority_of(demand);
        let available = match self.ledger.reserve(model, bytes, priority == LoadPriority::Predictive) {
            Ok(token) => return Ok((token, priority)),
            Err(LedgerError::Insufficient { available, .. }) => available,
            Err(e) => {
                return Err((
                    LoadError::LoadFailed {
                        model: model.clone(),
                        reason: e.to_string(),
                    },
                    priority,
                ))
            }
        };

        let priority = priority_of(demand);
        let scope = match priority {
            LoadPriority::Demand => EvictionScope::Any,
            LoadPriority::Predictive => EvictionScope::PredictiveOnly,
        };
        let candidates = self.candidates(Some(model));
        let needed = bytes.saturating_sub(available);
        let Some(victims) = select_victims(&candidates, needed, scope) else {
            let reclaimable: u64 = candidates
                .iter()
                .filter(|c| c.is_evictable() && (scope == EvictionScope::Any || c.predictive))
                .map(|c| c.bytes)
                .sum();
            return Err((
                LoadError::InsufficientVram {
                    model: model.clone(),
                    requested: bytes,
                    reclaimable: available + reclaimable,
                },
                priority,
            ));
        };

        tracing::info!(
            model = %model,
            needed,
            victims = victims.len(),
            "evicting to make room"
        );
        for victim in &victims {
            self.evict(victim).await;
        }

        let priority = priority_of(demand);
        self.ledger
            .reserve(model, bytes, priority == LoadPriority::Predictive)
            .map(|token| (token, priority))
            .map_err(|e| {
                let error = match e {
                    LedgerError::Insufficient { available, .. } => LoadError::InsufficientVram {
                        model: model.clone(),
                        requested: bytes,
                        reclaimable: available,
                    },
                    other => LoadError::LoadFailed {
                        model: model.clone(),
                        reason: other.to_string(),
                    },
                };
                (error, priority)
            })
    }

    fn candidates(&self, exclude: Option<&ModelId>) -> Vec<EvictionCandidate> {
        self.registry
            .snapshot()
            .iter()
            .filter(|d| Some(&d.id) != exclude)
            .map(|d| {
                let bytes = self.ledger.allocation(&d.id).unwrap_or(0);
                EvictionCandidate::from_descriptor(d, bytes, self.ledger.is_predictive(&d.id))
            })
            .collect()
    }

    async fn evict(&self, model: &ModelId) -> bool {
        let Some(slot) = self.registry.slot(model) else {
            return false;
        };
        // A model mid-transition is skipped rather than waited on.
        let Ok(_transition) = slot.transition.try_lock() else {
            self.metrics.lock().evictions_deferred += 1;
            return false;
        };
        match self.registry.begin_eviction(&slot, false) {
            Ok((_, handle)) => self.finish_unload(model, &slot, handle).await.is_ok(),
            Err(EvictionRefusal::InUse(in_flight)) => {
                tracing::debug!(model = %model, in_flight, "eviction deferred");
                self.metrics.lock().evictions_deferred += 1;
                false
            }
            Err(_) => false,
        }
    }

    /// Second half of an unload: backend call without any descriptor lock
    /// held, then ledger release. The caller holds the transition lock.
    async fn finish_unload(
        &self,
        model: &ModelId,
        slot: &ModelSlot,
        handle: Option<ModelHandle>,
    ) -> Result<(), LoadError> {
        let kind = slot.read(|d| d.backend_kind);
        if let (Some(handle), Some(backend)) = (handle, self.backends.for_kind(kind)) {
            if let Err(e) = backend.unload(model, handle).await {
                tracing::warn!(model = %model, error = %e, "backend unload failed; keeping model resident");
                let _ = self.registry.transition(slot, ModelState::Resident);
                return Err(LoadError::UnloadFailed {
                    model: model.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let freed = self.ledger.release(model).unwrap_or(0);
        slot.update(|d| d.handle = None);
        let _ = self.registry.transition(slot, ModelState::Unloaded);
        self.metrics.lock().evictions += 1;
        metrics::counter!("orchestrator_evictions_total").increment(1);
        tracing::info!(model = %model, freed_bytes = freed, "model unloaded");
        Ok(())
    }

    fn record_load(&self, elapsed_ms: u64, priority: LoadPriority) {
        let mut m = self.metrics.lock();
        m.total_loads += 1;
        if priority == LoadPriority::Predictive {
            m.predictive_loads += 1;
        }
        let n = m.total_loads as f64;
        m.avg_load_ms = (m.avg_load_ms * (n - 1.0) + elapsed_ms as f64) / n;
        metrics::counter!("orchestrator_loads_total").increment(1);
    }
}

fn priority_of(demand: &AtomicBool) -> LoadPriority {
    if demand.load(Ordering::Acquire) {
        LoadPriority::Demand
    } else {
        LoadPriority::Predictive
    }
}

#[cfg(test)]
#[path = "loader_tests.rs"]
mod tests;
