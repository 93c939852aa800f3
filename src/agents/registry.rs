//! Agent registry: arena of worker agents keyed by `AgentId`.
//!
//! Every state change is validated, recorded in a bounded log and published
//! on the agent's watch channel, which is what activation waits on.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;

pub use super::registry_types::*;

const MAX_TRANSITIONS: usize = 1024;

struct AgentSlot {
    descriptor: Mutex<AgentDescriptor>,
    state_tx: watch::Sender<AgentState>,
}

pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<AgentSlot>>,
    log: Mutex<VecDeque<AgentTransition>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
            log: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_catalog(
        catalog: impl IntoIterator<Item = AgentDescriptor>,
    ) -> Result<Self, AgentError> {
        let registry = Self::new();
        for descriptor in catalog {
            registry.register(descriptor)?;
        }
        Ok(registry)
    }

    pub fn register(&self, mut descriptor: AgentDescriptor) -> Result<(), AgentError> {
        use dashmap::mapref::entry::Entry;

        descriptor.state = AgentState::Dormant;
        match self.agents.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => Err(AgentError::Duplicate(descriptor.id)),
            Entry::Vacant(v) => {
                let (state_tx, _) = watch::channel(AgentState::Dormant);
                v.insert(Arc::new(AgentSlot {
                    descriptor: Mutex::new(descriptor),
                    state_tx,
                }));
                Ok(())
            }
        }
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentDescriptor> {
        self.slot(id).map(|s| s.descriptor.lock().clone())
    }

    pub fn state(&self, id: &AgentId) -> Option<AgentState> {
        self.slot(id).map(|s| s.descriptor.lock().state)
    }

    /// Every descriptor, sorted by id.
    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        let slots: Vec<Arc<AgentSlot>> = self.agents.iter().map(|e| e.value().clone()).collect();
        let mut out: Vec<AgentDescriptor> =
            slots.iter().map(|s| s.descriptor.lock().clone()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }

    pub fn subscribe(&self, id: &AgentId) -> Result<watch::Receiver<AgentState>, AgentError> {
        self.slot(id)
            .map(|s| s.state_tx.subscribe())
            .ok_or_else(|| AgentError::NotFound(id.clone()))
    }

    /// Claim an agent for startup. Only one caller ever gets `Launch` for a
    /// given activation.
    pub fn claim_start(&self, id: &AgentId) -> Result<StartClaim, AgentError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        let from = {
            let mut d = slot.descriptor.lock();
            match d.state {
                AgentState::Running => return Ok(StartClaim::AlreadyRunning),
                AgentState::Starting => return Ok(StartClaim::AlreadyStarting),
                from => {
                    if from == AgentState::Failed {
                        d.restarts = 0;
                    }
                    d.state = AgentState::Starting;
                    d.started_at = Some(Instant::now());
                    d.last_heartbeat_at = None;
                    from
                }
            }
        };
        self.publish(&slot, id, from, AgentState::Starting);
        Ok(StartClaim::Launch)
    }

    /// Record a heartbeat. A starting agent becomes running on its first one.
    pub fn heartbeat(&self, id: &AgentId) -> Result<AgentState, AgentError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        let (from, to) = {
            let mut d = slot.descriptor.lock();
            d.last_heartbeat_at = Some(Instant::now());
            match d.state {
                AgentState::Starting => {
                    d.state = AgentState::Running;
                    (AgentState::Starting, AgentState::Running)
                }
                other => return Ok(other),
            }
        };
        self.publish(&slot, id, from, to);
        Ok(to)
    }

    /// Validated state change. Returns the previous state.
    pub fn transition(&self, id: &AgentId, to: AgentState) -> Result<AgentState, AgentError> {
        self.transition_with(id, to, |_| {})
    }

    /// Mark an agent crashed with a reason.
    pub fn mark_crashed(&self, id: &AgentId, reason: &str) -> Result<AgentState, AgentError> {
        self.transition_with(id, AgentState::Crashed, |d| {
            d.last_error = Some(reason.to_string());
        })
    }

    /// Count an automatic restart.
    pub fn note_restart(&self, id: &AgentId) -> Option<u32> {
        let slot = self.slot(id)?;
        let mut d = slot.descriptor.lock();
        d.restarts += 1;
        d.last_restart_at = Some(Instant::now());
        Some(d.restarts)
    }

    pub fn reset_restarts(&self, id: &AgentId) {
        if let Some(slot) = self.slot(id) {
            slot.descriptor.lock().restarts = 0;
        }
    }

    /// Recent transitions, oldest first.
    pub fn transitions(&self) -> Vec<AgentTransition> {
        self.log.lock().iter().cloned().collect()
    }

    fn transition_with(
        &self,
        id: &AgentId,
        to: AgentState,
        apply: impl FnOnce(&mut AgentDescriptor),
    ) -> Result<AgentState, AgentError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| AgentError::NotFound(id.clone()))?;
        let from = {
            let mut d = slot.descriptor.lock();
            let from = d.state;
            if !from.can_transition_to(to) {
                return Err(AgentError::InvalidTransition {
                    agent: id.clone(),
                    from,
                    to,
                });
            }
            d.state = to;
            apply(&mut d);
            from
        };
        self.publish(&slot, id, from, to);
        Ok(from)
    }

    fn publish(&self, slot: &AgentSlot, id: &AgentId, from: AgentState, to: AgentState) {
        slot.state_tx.send_replace(to);
        tracing::debug!(agent = %id, %from, %to, "agent state transition");
        let mut log = self.log.lock();
        log.push_back(AgentTransition {
            agent: id.clone(),
            from,
            to,
            at: Instant::now(),
        });
        if log.len() > MAX_TRANSITIONS {
            log.pop_front();
        }
    }

    fn slot(&self, id: &AgentId) -> Option<Arc<AgentSlot>> {
        self.agents.get(id).map(|e| e.value().clone())
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        AgentRegistry::from_catalog([AgentDescriptor::new("asr")]).unwrap()
    }

    #[test]
    fn test_only_one_claim_wins() {
        let registry = registry();
        let id = AgentId::from("asr");
        assert_eq!(registry.claim_start(&id).unwrap(), StartClaim::Launch);
        assert_eq!(registry.claim_start(&id).unwrap(), StartClaim::AlreadyStarting);

        registry.heartbeat(&id).unwrap();
        assert_eq!(registry.claim_start(&id).unwrap(), StartClaim::AlreadyRunning);
    }

    #[test]
    fn test_first_heartbeat_marks_running() {
        let registry = registry();
        let id = AgentId::from("asr");
        let mut rx = registry.subscribe(&id).unwrap();

        registry.claim_start(&id).unwrap();
        assert_eq!(registry.heartbeat(&id).unwrap(), AgentState::Running);
        assert_eq!(*rx.borrow_and_update(), AgentState::Running);
        assert!(registry.get(&id).unwrap().last_heartbeat_at.is_some());
    }

    #[test]
    fn test_heartbeat_does_not_revive_crashed_agent() {
        let registry = registry();
        let id = AgentId::from("asr");
        registry.claim_start(&id).unwrap();
        registry.mark_crashed(&id, "exit code 1").unwrap();

        assert_eq!(registry.heartbeat(&id).unwrap(), AgentState::Crashed);
        assert_eq!(
            registry.get(&id).unwrap().last_error.as_deref(),
            Some("exit code 1")
        );
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let registry = registry();
        let err = registry
            .transition(&AgentId::from("asr"), AgentState::Running)
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidTransition { .. }));
        assert!(registry.transitions().is_empty());
    }

    #[test]
    fn test_claim_from_failed_clears_restart_budget() {
        let registry = registry();
        let id = AgentId::from("asr");
        registry.claim_start(&id).unwrap();
        registry.mark_crashed(&id, "boom").unwrap();
        registry.note_restart(&id);
        registry.note_restart(&id);
        registry.transition(&id, AgentState::Failed).unwrap();

        assert_eq!(registry.claim_start(&id).unwrap(), StartClaim::Launch);
        assert_eq!(registry.get(&id).unwrap().restarts, 0);
    }
}
