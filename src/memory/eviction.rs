//! Eviction candidate selection.
//!
//! Pure functions over a snapshot; the loader performs the actual unloads.

use std::cmp::Ordering;
use std::time::Instant;

use crate::models::{ModelDescriptor, ModelId, ModelState};

/// Snapshot of one model as seen by the eviction policy.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub id: ModelId,
    /// Bytes freed in the ledger if evicted.
    pub bytes: u64,
    pub last_used_at: Option<Instant>,
    pub in_flight: usize,
    pub pinned: bool,
    pub predictive: bool,
    pub state: ModelState,
}

impl EvictionCandidate {
    pub fn from_descriptor(d: &ModelDescriptor, bytes: u64, predictive: bool) -> Self {
        Self {
            id: d.id.clone(),
            bytes,
            last_used_at: d.last_used_at,
            in_flight: d.in_flight,
            pinned: d.pinned,
            predictive,
            state: d.state,
        }
    }

    /// Resident, unpinned and idle. Busy models are deferred, never forced.
    pub fn is_evictable(&self) -> bool {
        self.state == ModelState::Resident && !self.pinned && self.in_flight == 0
    }
}

/// Which candidates a request may displace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionScope {
    /// Demand loads may evict anything evictable.
    Any,
    /// Predictive loads may only displace other predictive models.
    PredictiveOnly,
}

/// Eviction order: predictive before demand, then least recently used
/// (never-used counts as oldest), then largest first.
pub fn eviction_order(a: &EvictionCandidate, b: &EvictionCandidate) -> Ordering {
    b.predictive
        .cmp(&a.predictive)
        .then_with(|| match (a.last_used_at, b.last_used_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        })
        .then_with(|| b.bytes.cmp(&a.bytes))
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the victims that free at least `needed_bytes`.
///
/// Returns `None` when even evicting every eligible candidate would not
/// free enough; nothing should be evicted in that case.
pub fn select_victims(
    candidates: &[EvictionCandidate],
    needed_bytes: u64,
    scope: EvictionScope,
) -> Option<Vec<ModelId>> {
    if needed_bytes == 0 {
        return Some(Vec::new());
    }

    let mut eligible: Vec<&EvictionCandidate> = candidates
        .iter()
        .filter(|c| c.is_evictable() && c.bytes > 0)
        .filter(|c| scope == EvictionScope::Any || c.predictive)
        .collect();
    eligible.sort_by(|a, b| eviction_order(a, b));

    let mut freed = 0u64;
    let mut victims = Vec::new();
    for c in eligible {
        if freed >= needed_bytes {
            break;
        }
        freed += c.bytes;
        victims.push(c.id.clone());
    }

    if freed >= needed_bytes {
        Some(victims)
    } else {
        None
    }
}

/// Evictable models idle for longer than `idle_for` at `now`.
pub fn select_idle(
    candidates: &[EvictionCandidate],
    now: Instant,
    idle_for: std::time::Duration,
) -> Vec<ModelId> {
    let mut idle: Vec<&EvictionCandidate> = candidates
        .iter()
        .filter(|c| c.is_evictable())
        .filter(|c| match c.last_used_at {
            Some(t) => now.saturating_duration_since(t) >= idle_for,
            None => true,
        })
        .collect();
    idle.sort_by(|a, b| eviction_order(a, b));
    idle.into_iter().map(|c| c.id.clone()).collect()
}
