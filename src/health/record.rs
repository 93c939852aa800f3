//! Health records and the collector that builds them from live state.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::AgentRegistry;
use crate::memory::VramBudget;
use crate::models::ModelLoader;
use crate::routing::{BreakerRegistry, BreakerView, CircuitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Model,
    Agent,
}

/// One model or agent, as pushed to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub id: String,
    pub kind: RecordKind,
    pub state: String,
    /// RFC 3339, absent if never used.
    pub last_used_at: Option<String>,
    pub vram_bytes: u64,
    /// State of the breaker guarding the backend that serves this entry.
    pub breaker_state: Option<CircuitState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub generated_at: String,
    pub host: String,
    pub uptime_secs: u64,
    pub budget: VramBudget,
    pub records: Vec<HealthRecord>,
    pub breakers: Vec<BreakerView>,
}

impl HealthSnapshot {
    /// Backends currently refusing traffic.
    pub fn open_breakers(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .count()
    }
}

/// Map a monotonic instant onto wall-clock time.
pub fn wall_clock(at: Instant, now: Instant, now_wall: DateTime<Utc>) -> String {
    let ago = now.saturating_duration_since(at);
    let at_wall = chrono::Duration::from_std(ago)
        .ok()
        .and_then(|d| now_wall.checked_sub_signed(d))
        .unwrap_or(now_wall);
    at_wall.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Reads registries, ledger and breakers into a [`HealthSnapshot`].
#[derive(Clone)]
pub struct HealthCollector {
    loader: ModelLoader,
    agents: Option<Arc<AgentRegistry>>,
    breakers: Arc<BreakerRegistry>,
    host: String,
    started: Instant,
}

impl HealthCollector {
    pub fn new(loader: ModelLoader, breakers: Arc<BreakerRegistry>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            loader,
            agents: None,
            breakers,
            host,
            started: Instant::now(),
        }
    }

    pub fn with_agents(mut self, agents: Arc<AgentRegistry>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn collect(&self) -> HealthSnapshot {
        let now = Instant::now();
        let now_wall = Utc::now();
        let ledger = self.loader.ledger();
        let backends = self.loader.backends();

        let mut records: Vec<HealthRecord> = self
            .loader
            .registry()
            .snapshot()
            .into_iter()
            .map(|m| HealthRecord {
                vram_bytes: ledger.allocation(&m.id).unwrap_or(0),
                breaker_state: backends
                    .for_kind(m.backend_kind)
                    .map(|b| self.breakers.state(b.id())),
                id: m.id.to_string(),
                kind: RecordKind::Model,
                state: m.state.as_str().to_string(),
                last_used_at: m.last_used_at.map(|t| wall_clock(t, now, now_wall)),
            })
            .collect();

        if let Some(agents) = &self.agents {
            records.extend(agents.snapshot().into_iter().map(|a| HealthRecord {
                id: a.id.to_string(),
                kind: RecordKind::Agent,
                state: a.state.as_str().to_string(),
                last_used_at: a.last_heartbeat_at.map(|t| wall_clock(t, now, now_wall)),
                vram_bytes: 0,
                breaker_state: None,
            }));
        }

        HealthSnapshot {
            generated_at: now_wall.to_rfc3339_opts(SecondsFormat::Millis, true),
            host: self.host.clone(),
            uptime_secs: now.duration_since(self.started).as_secs(),
            budget: ledger.snapshot(),
            records,
            breakers: self.breakers.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VramLedger;
    use crate::models::{
        BackendKind, BackendSet, LoaderConfig, ModelDescriptor, ModelId, ModelRegistry,
        SimulatedBackend,
    };
    use crate::agents::AgentDescriptor;
    use crate::routing::{BreakerConfig, Outcome};
    use std::time::Duration;

    fn collector() -> (HealthCollector, ModelLoader, Arc<BreakerRegistry>) {
        let registry = ModelRegistry::from_catalog([
            ModelDescriptor::new("whisper", "v3", 2_000, BackendKind::LocalGpu),
            ModelDescriptor::new("gpt", "", 0, BackendKind::Remote),
        ])
        .unwrap();
        let loader = ModelLoader::new(
            Arc::new(registry),
            Arc::new(VramLedger::new(8_000, 1_000).unwrap()),
            BackendSet::new()
                .with(Arc::new(SimulatedBackend::new("gpu0", BackendKind::LocalGpu)))
                .with(Arc::new(SimulatedBackend::new("cloud", BackendKind::Remote))),
            LoaderConfig::default(),
        );
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        }));
        let agents =
            Arc::new(AgentRegistry::from_catalog([AgentDescriptor::new("tutor")]).unwrap());
        let collector =
            HealthCollector::new(loader.clone(), breakers.clone()).with_agents(agents);
        (collector, loader, breakers)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_resident_models() {
        let (collector, loader, breakers) = collector();
        let whisper = ModelId::from("whisper@v3");
        loader.load(&whisper, Duration::from_secs(1)).await.unwrap();
        breakers.record("cloud", Outcome::Failure, Instant::now());

        let snapshot = collector.collect();

        let model = snapshot.records.iter().find(|r| r.id == "whisper@v3").unwrap();
        assert_eq!(model.state, "resident");
        assert_eq!(model.vram_bytes, 2_000);
        assert_eq!(model.breaker_state, Some(CircuitState::Closed));
        assert!(model.last_used_at.is_some());

        let remote = snapshot.records.iter().find(|r| r.id == "gpt").unwrap();
        assert_eq!(remote.breaker_state, Some(CircuitState::Open));
        assert_eq!(snapshot.open_breakers(), 1);
        assert_eq!(snapshot.budget.used_bytes, 2_000);

        let agent = snapshot.records.iter().find(|r| r.kind == RecordKind::Agent).unwrap();
        assert_eq!(agent.state, "dormant");
        assert!(agent.last_used_at.is_none());
    }

    #[test]
    fn test_wall_clock_is_rfc3339_in_the_past() {
        let now = Instant::now();
        let now_wall = Utc::now();
        let earlier = now.checked_sub(Duration::from_secs(90)).unwrap_or(now);

        let stamp = wall_clock(earlier, now, now_wall);
        let parsed = DateTime::parse_from_rfc3339(&stamp).unwrap();
        assert!(parsed.with_timezone(&Utc) <= now_wall);
        assert!(stamp.ends_with('Z'));
    }
}
