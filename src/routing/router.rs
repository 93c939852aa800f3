//! Hybrid Router - picks a backend per task.
//!
//! Heavy tasks (score at or above the threshold) go to the preferred heavy
//! backend, everything else runs locally. A tripped breaker sends the task
//! to the failover backend and flags the decision degraded. The router
//! never touches VRAM or registry state itself; it asks the loader and the
//! agent loader.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::breaker::{Admission, Outcome};
use super::breaker_registry::BreakerRegistry;
pub use super::router_types::*;
use super::rules::RuleSet;
use crate::agents::LazyAgentLoader;
use crate::models::{BackendSet, LoadError, LoadPriority, ModelLoader, ModelState};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub heavy_threshold: f64,
    /// Backend for tasks below the threshold.
    pub local_backend: String,
    /// Backend for heavy tasks without a rule-specific one.
    pub heavy_backend: String,
    /// Failover used when neither the rule nor the pairing names one.
    pub failover_backend: Option<String>,
    /// How long a decision is replayed for retries of the same task.
    pub decision_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heavy_threshold: 0.8,
            local_backend: "local-gpu".into(),
            heavy_backend: "remote".into(),
            failover_backend: None,
            decision_ttl: Duration::from_secs(300),
        }
    }
}

struct CachedDecision {
    decision: RouteDecision,
    at: Instant,
}

pub struct HybridRouter {
    rules: RuleSet,
    breakers: Arc<BreakerRegistry>,
    loader: ModelLoader,
    agents: Option<LazyAgentLoader>,
    backends: BackendSet,
    config: RouterConfig,
    decisions: DashMap<String, CachedDecision>,
}

impl HybridRouter {
    pub fn new(
        rules: RuleSet,
        breakers: Arc<BreakerRegistry>,
        loader: ModelLoader,
        config: RouterConfig,
    ) -> Self {
        let backends = loader.backends().clone();
        Self {
            rules,
            breakers,
            loader,
            agents: None,
            backends,
            config,
            decisions: DashMap::new(),
        }
    }

    pub fn with_agents(mut self, agents: LazyAgentLoader) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub async fn route(&self, task: &TaskRequest) -> Result<RouteDecision, RouteError> {
        if let Some(cached) = self.cached(&task.id) {
            tracing::debug!(task = %task.id, backend = %cached.backend_id, "replaying route decision");
            return self.revalidate(task, cached).await;
        }

        let deadline = tokio::time::Instant::now() + task.deadline();
        let class = self.rules.classify(task);
        let heavy = class.score >= self.config.heavy_threshold;
        let rule = class.rule;

        let (primary, default_failover) = if heavy {
            let preferred = rule
                .and_then(|r| r.preferred_backend.clone())
                .unwrap_or_else(|| self.config.heavy_backend.clone());
            (preferred, self.config.local_backend.clone())
        } else {
            (self.config.local_backend.clone(), self.config.heavy_backend.clone())
        };
        let failover = rule
            .and_then(|r| r.failover_backend.clone())
            .or_else(|| self.config.failover_backend.clone())
            .unwrap_or(default_failover);

        let (backend_id, degraded) = self.select(&primary, &failover)?;
        let kind = self
            .backends
            .kind_of(&backend_id)
            .ok_or_else(|| RouteError::UnknownBackend(backend_id.clone()))?;

        let agent = rule.and_then(|r| r.agent.clone());
        if let (Some(agent), Some(loader)) = (&agent, &self.agents) {
            loader.ensure(agent, deadline).await?;
        }

        let model_handle = match (&task.required_model, kind.is_local()) {
            (Some(model), true) => match self
                .loader
                .load_until(model, deadline, LoadPriority::Demand)
                .await
            {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if matches!(e, LoadError::LoadFailed { .. }) {
                        self.breakers.record(&backend_id, Outcome::Failure, Instant::now());
                    }
                    return Err(e.into());
                }
            },
            _ => None,
        };

        let decision = if degraded {
            Decision::Degraded
        } else if kind.is_local() {
            Decision::Local
        } else {
            Decision::Remote
        };
        let record = RouteDecision {
            task_id: task.id.clone(),
            decision,
            backend_id,
            model_handle,
            complexity: class.score,
            rule: rule.map(|r| r.name.clone()),
            agent,
        };

        metrics::counter!("orchestrator_route_decisions_total", "decision" => decision.as_str())
            .increment(1);
        tracing::info!(
            task = %task.id,
            task_type = %task.task_type,
            priority = ?task.priority,
            decision = %decision,
            backend = %record.backend_id,
            complexity = class.score,
            "task routed"
        );

        self.decisions.insert(
            task.id.clone(),
            CachedDecision {
                decision: record.clone(),
                at: Instant::now(),
            },
        );
        Ok(record)
    }

    /// Feed a dispatch outcome into the backend's breaker.
    pub fn record_outcome(&self, backend: &str, outcome: Outcome) {
        self.breakers.record(backend, outcome, Instant::now());
    }

    /// Drop expired decision records. Returns how many were removed.
    pub fn purge_decisions(&self, now: Instant) -> usize {
        let before = self.decisions.len();
        let ttl = self.config.decision_ttl;
        self.decisions
            .retain(|_, d| now.saturating_duration_since(d.at) < ttl);
        before - self.decisions.len()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.len()
    }

    /// A replayed decision keeps its backend, but its model handle must still
    /// name the resident copy; an evicted model is loaded again.
    async fn revalidate(
        &self,
        task: &TaskRequest,
        mut cached: RouteDecision,
    ) -> Result<RouteDecision, RouteError> {
        let (Some(model), Some(handle)) = (&task.required_model, cached.model_handle) else {
            return Ok(cached);
        };
        let current = self
            .loader
            .registry()
            .get(model)
            .filter(|d| d.state == ModelState::Resident)
            .and_then(|d| d.handle);
        if current == Some(handle) {
            return Ok(cached);
        }

        tracing::debug!(task = %task.id, model = %model, "cached model handle stale; reloading");
        let deadline = tokio::time::Instant::now() + task.deadline();
        let fresh = self
            .loader
            .load_until(model, deadline, LoadPriority::Demand)
            .await?;
        cached.model_handle = Some(fresh);
        if let Some(mut entry) = self.decisions.get_mut(&task.id) {
            entry.decision.model_handle = Some(fresh);
        }
        Ok(cached)
    }

    fn cached(&self, task_id: &str) -> Option<RouteDecision> {
        let entry = self.decisions.get(task_id)?;
        if entry.at.elapsed() < self.config.decision_ttl {
            Some(entry.decision.clone())
        } else {
            None
        }
    }

    fn select(&self, primary: &str, failover: &str) -> Result<(String, bool), RouteError> {
        let now = Instant::now();
        if self.breakers.admit(primary, now) != Admission::Rejected {
            return Ok((primary.to_string(), false));
        }
        if failover != primary && self.breakers.admit(failover, now) != Admission::Rejected {
            tracing::warn!(primary, failover, "preferred backend tripped; failing over");
            return Ok((failover.to_string(), true));
        }
        Err(RouteError::BackendUnavailable {
            backend: primary.to_string(),
        })
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
