//! Model registry: arena of catalogued models keyed by `ModelId`.
//!
//! Each entry carries its own descriptor lock and an async transition lock,
//! so unrelated models never contend. Descriptor locks are never held across
//! an `.await`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;

pub use super::registry_types::*;

/// Maximum number of transitions kept in the diagnostic log.
const MAX_TRANSITIONS: usize = 1024;

/// One arena entry.
pub(crate) struct ModelSlot {
    descriptor: Mutex<ModelDescriptor>,
    /// Serializes lifecycle transactions (load, evict, unload) for this model.
    pub(crate) transition: tokio::sync::Mutex<()>,
}

impl ModelSlot {
    pub(crate) fn read<R>(&self, f: impl FnOnce(&ModelDescriptor) -> R) -> R {
        f(&self.descriptor.lock())
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ModelDescriptor) -> R) -> R {
        f(&mut self.descriptor.lock())
    }
}

/// Thread-safe registry of catalogued models.
pub struct ModelRegistry {
    models: DashMap<ModelId, Arc<ModelSlot>>,
    transitions: Mutex<VecDeque<ModelTransition>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: DashMap::new(),
            transitions: Mutex::new(VecDeque::new()),
        }
    }

    /// Build a registry from a static catalog.
    pub fn from_catalog(
        catalog: impl IntoIterator<Item = ModelDescriptor>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for descriptor in catalog {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    /// Add a catalog entry. Only used at bootstrap.
    pub fn register(&self, mut descriptor: ModelDescriptor) -> Result<(), RegistryError> {
        use dashmap::mapref::entry::Entry;

        descriptor.state = ModelState::Unloaded;
        descriptor.handle = None;
        descriptor.in_flight = 0;
        match self.models.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(descriptor.id)),
            Entry::Vacant(v) => {
                v.insert(Arc::new(ModelSlot {
                    descriptor: Mutex::new(descriptor),
                    transition: tokio::sync::Mutex::new(()),
                }));
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    /// Snapshot of one descriptor.
    pub fn get(&self, id: &ModelId) -> Option<ModelDescriptor> {
        self.slot(id).map(|slot| slot.read(|d| d.clone()))
    }

    pub fn state(&self, id: &ModelId) -> Option<ModelState> {
        self.slot(id).map(|slot| slot.read(|d| d.state))
    }

    /// Snapshot of every descriptor, sorted by id for stable output.
    pub fn snapshot(&self) -> Vec<ModelDescriptor> {
        let slots: Vec<Arc<ModelSlot>> = self.models.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<ModelDescriptor> = slots.iter().map(|s| s.read(|d| d.clone())).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn count(&self) -> usize {
        self.models.len()
    }

    pub fn resident_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|d| d.state == ModelState::Resident)
            .count()
    }

    /// Take an in-flight reference on a model. Eviction defers while any
    /// lease is alive.
    pub fn lease(&self, id: &ModelId) -> Result<ModelLease, RegistryError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        slot.update(|d| d.in_flight += 1);
        Ok(ModelLease {
            id: id.clone(),
            slot,
        })
    }

    /// Recent lifecycle transitions, oldest first.
    pub fn transitions(&self) -> Vec<ModelTransition> {
        self.transitions.lock().iter().cloned().collect()
    }

    pub(crate) fn slot(&self, id: &ModelId) -> Option<Arc<ModelSlot>> {
        self.models.get(id).map(|e| e.value().clone())
    }

    /// Apply a validated state change. The caller must hold the slot's
    /// transition lock.
    pub(crate) fn transition(
        &self,
        slot: &ModelSlot,
        to: ModelState,
    ) -> Result<ModelState, RegistryError> {
        let (model, from) = slot.update(|d| {
            let from = d.state;
            if !from.can_transition_to(to) {
                return Err(RegistryError::InvalidTransition {
                    model: d.id.clone(),
                    from,
                    to,
                });
            }
            d.state = to;
            Ok((d.id.clone(), from))
        })?;
        self.record(model, from, to);
        Ok(from)
    }

    /// Move an idle resident model to `Evicting` in one step, so no lease
    /// can slip in between the check and the transition.
    pub(crate) fn begin_eviction(
        &self,
        slot: &ModelSlot,
        allow_pinned: bool,
    ) -> Result<(ModelId, Option<ModelHandle>), EvictionRefusal> {
        let (model, handle) = slot.update(|d| {
            if d.state != ModelState::Resident {
                return Err(EvictionRefusal::NotResident(d.state));
            }
            if d.in_flight > 0 {
                return Err(EvictionRefusal::InUse(d.in_flight));
            }
            if d.pinned && !allow_pinned {
                return Err(EvictionRefusal::Pinned);
            }
            d.state = ModelState::Evicting;
            Ok((d.id.clone(), d.handle))
        })?;
        self.record(model.clone(), ModelState::Resident, ModelState::Evicting);
        Ok((model, handle))
    }

    fn record(&self, model: ModelId, from: ModelState, to: ModelState) {
        tracing::debug!(model = %model, %from, %to, "model state transition");
        let mut log = self.transitions.lock();
        log.push_back(ModelTransition {
            model,
            from,
            to,
            at: Instant::now(),
        });
        if log.len() > MAX_TRANSITIONS {
            log.pop_front();
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight reference to a model. Dropping it releases the reference and
/// refreshes `last_used_at`.
pub struct ModelLease {
    id: ModelId,
    slot: Arc<ModelSlot>,
}

impl ModelLease {
    pub fn model_id(&self) -> &ModelId {
        &self.id
    }

    /// Current handle, if the model is resident.
    pub fn handle(&self) -> Option<ModelHandle> {
        self.slot.read(|d| {
            if d.state == ModelState::Resident {
                d.handle
            } else {
                None
            }
        })
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease").field("id", &self.id).finish()
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.slot.update(|d| {
            d.in_flight = d.in_flight.saturating_sub(1);
            d.last_used_at = Some(Instant::now());
        });
    }
}
