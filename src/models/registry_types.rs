//! Types for the model registry.
//!
//! Extracted from `registry.rs` to keep the arena logic readable.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::backend::BackendKind;

/// Stable identity of a catalogued model (`name` or `name@version`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(name: &str, version: &str) -> Self {
        if version.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}@{}", name, version))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique handle to a resident model, issued by the backend that loaded it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelHandle(u64);

impl ModelHandle {
    /// Create a new handle with the given ID (primarily for backends and tests).
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a catalogued model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Resident,
    Evicting,
    Failed,
}

impl ModelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Resident => "resident",
            ModelState::Evicting => "evicting",
            ModelState::Failed => "failed",
        }
    }

    /// Edges of the lifecycle graph. Anything else is a loader bug.
    pub fn can_transition_to(&self, next: ModelState) -> bool {
        use ModelState::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Failed, Loading)
                | (Failed, Unloaded)
                | (Loading, Resident)
                | (Loading, Failed)
                | (Loading, Unloaded)
                | (Resident, Evicting)
                | (Evicting, Unloaded)
                | (Evicting, Resident)
        )
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog entry plus live lifecycle bookkeeping for one model.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub id: ModelId,
    pub name: String,
    pub version: String,
    pub size_bytes: u64,
    pub backend_kind: BackendKind,
    /// Amortized load cost estimate, used by callers to size timeouts.
    pub load_cost_ms: u64,
    /// Never selected for eviction.
    pub pinned: bool,
    pub last_used_at: Option<Instant>,
    pub state: ModelState,
    pub handle: Option<ModelHandle>,
    /// Live `ModelLease` count.
    pub in_flight: usize,
    pub consecutive_failures: u32,
    /// A `Failed` model is not retried before this instant.
    pub retry_after: Option<Instant>,
}

impl ModelDescriptor {
    pub fn new(name: &str, version: &str, size_bytes: u64, backend_kind: BackendKind) -> Self {
        Self {
            id: ModelId::new(name, version),
            name: name.to_string(),
            version: version.to_string(),
            size_bytes,
            backend_kind,
            load_cost_ms: 0,
            pinned: false,
            last_used_at: None,
            state: ModelState::Unloaded,
            handle: None,
            in_flight: 0,
            consecutive_failures: 0,
            retry_after: None,
        }
    }

    pub fn with_load_cost_ms(mut self, ms: u64) -> Self {
        self.load_cost_ms = ms;
        self
    }

    pub fn pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Bytes this model holds in the VRAM ledger while resident.
    pub fn vram_bytes(&self) -> u64 {
        if self.backend_kind.consumes_vram() {
            self.size_bytes
        } else {
            0
        }
    }
}

/// One recorded state change, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct ModelTransition {
    pub model: ModelId,
    pub from: ModelState,
    pub to: ModelState,
    pub at: Instant,
}

/// Why a model could not start evicting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionRefusal {
    NotResident(ModelState),
    /// Live leases; eviction is deferred, never forced.
    InUse(usize),
    Pinned,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Model already registered: {0}")]
    Duplicate(ModelId),

    #[error("Model not found: {0}")]
    NotFound(ModelId),

    #[error("Invalid transition for {model}: {from} -> {to}")]
    InvalidTransition {
        model: ModelId,
        from: ModelState,
        to: ModelState,
    },
}
