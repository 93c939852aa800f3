//! Per-backend circuit breakers.
//!
//! A backend gets a breaker on its first failure; until then it is treated
//! as closed. Breakers that stay quietly closed past the retention window
//! are dropped by [`BreakerRegistry::gc`].

use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::breaker::{Admission, BreakerConfig, BreakerState, CircuitState, Outcome};

/// Read-only view of one backend's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerView {
    pub backend: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub recovery_timeout_ms: u64,
}

pub struct BreakerRegistry {
    breakers: DashMap<String, BreakerState>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn admit(&self, backend: &str, now: Instant) -> Admission {
        let Some(mut entry) = self.breakers.get_mut(backend) else {
            return Admission::Allowed;
        };
        let (next, admission) = entry.value().clone().admit(now, &self.config);
        if next.state != entry.state {
            tracing::info!(backend, from = %entry.state, to = %next.state, "circuit breaker transition");
        }
        *entry = next;
        admission
    }

    /// Current state without advancing it.
    pub fn state(&self, backend: &str) -> CircuitState {
        self.breakers
            .get(backend)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn record(&self, backend: &str, outcome: Outcome, now: Instant) {
        if outcome.is_success() && !self.breakers.contains_key(backend) {
            return;
        }
        let mut entry = self
            .breakers
            .entry(backend.to_string())
            .or_insert_with(|| BreakerState::new(now, &self.config));
        let before = entry.state;
        let next = entry.value().clone().on_outcome(outcome, now, &self.config);
        if next.state != before {
            if next.state == CircuitState::Open {
                tracing::warn!(
                    backend,
                    failures = next.failure_count,
                    recovery_ms = next.recovery_timeout.as_millis() as u64,
                    "circuit breaker opened"
                );
            } else {
                tracing::info!(backend, from = %before, to = %next.state, "circuit breaker transition");
            }
        }
        *entry = next;
    }

    /// Drop breakers closed and quiet for longer than the retention window,
    /// measured from their last recorded outcome.
    pub fn gc(&self, now: Instant) -> usize {
        let before = self.breakers.len();
        self.breakers
            .retain(|_, b| !b.is_idle(now, &self.config));
        before - self.breakers.len()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<BreakerView> {
        let mut views: Vec<BreakerView> = self
            .breakers
            .iter()
            .map(|e| BreakerView {
                backend: e.key().clone(),
                state: e.state,
                failure_count: e.failure_count,
                recovery_timeout_ms: e.recovery_timeout.as_millis() as u64,
            })
            .collect();
        views.sort_by(|a, b| a.backend.cmp(&b.backend));
        views
    }
}
