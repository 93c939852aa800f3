//! Orchestrator: builds every component from configuration, hands each one
//! explicit handles to its collaborators and owns the background tasks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{
    ActivationError, AgentError, AgentGraph, AgentId, AgentLauncher, AgentRegistry, AgentState,
    CommandLauncher, GraphError, LazyAgentLoader, Ready, SimulatedLauncher, Supervisor,
    SupervisorHandle,
};
use crate::config::{LauncherKind, OrchestratorConfig};
use crate::health::{HealthCollector, HealthReporter, HealthSnapshot, TracingSink};
use crate::memory::{LedgerError, VramLedger, VramMonitor};
use crate::models::{
    BackendError, BackendSet, HintOutcome, InvokeOutput, LoadError, ModelHandle, ModelId,
    ModelLoader, ModelRegistry, Preloader, RegistryError, SimulatedBackend,
};
use crate::routing::{
    BreakerRegistry, CircuitState, HybridRouter, Outcome, RouteDecision, RouteError, RuleError,
    RuleSet, TaskRequest,
};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Agents(#[from] AgentError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Rules(#[from] RuleError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Backend {backend} failed: {source}")]
    Backend {
        backend: String,
        #[source]
        source: BackendError,
    },

    #[error("Task {0} missed its deadline")]
    DeadlineExceeded(String),
}

/// Result of routing and executing one task.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub decision: RouteDecision,
    pub output: InvokeOutput,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    loader: ModelLoader,
    preloader: Preloader,
    agents: LazyAgentLoader,
    router: HybridRouter,
    breakers: Arc<BreakerRegistry>,
    collector: HealthCollector,
    supervisor: Mutex<Option<Supervisor>>,
    supervisor_handle: SupervisorHandle,
}

/// One simulated backend per `[[backends]]` entry.
pub fn backends_from_config(config: &OrchestratorConfig) -> BackendSet {
    config.backends.iter().fold(BackendSet::new(), |set, entry| {
        set.with(Arc::new(SimulatedBackend::with_config(
            &entry.id,
            entry.kind,
            entry.simulated_config(),
        )))
    })
}

impl Orchestrator {
    /// Build from a validated configuration.
    pub fn build(config: OrchestratorConfig) -> Result<Self, BuildError> {
        let backends = backends_from_config(&config);
        Self::build_with(config, backends, None)
    }

    /// Build with explicit backends and, optionally, an explicit launcher.
    pub fn build_with(
        config: OrchestratorConfig,
        backends: BackendSet,
        launcher: Option<Arc<dyn AgentLauncher>>,
    ) -> Result<Self, BuildError> {
        let ledger = Arc::new(VramLedger::new(
            config.vram.total_bytes,
            config.vram.reserved_bytes,
        )?);
        let registry = Arc::new(ModelRegistry::from_catalog(
            config.models.iter().map(|m| m.to_descriptor()),
        )?);
        let loader = ModelLoader::new(
            registry,
            ledger,
            backends,
            config.loader.to_loader_config(),
        );
        let preloader = Preloader::new(loader.clone(), config.preloader.to_preloader_config());

        let descriptors: Vec<_> = config.agents.catalog.iter().map(|a| a.to_descriptor()).collect();
        let graph = Arc::new(AgentGraph::new(&descriptors)?);
        let agent_registry = Arc::new(AgentRegistry::from_catalog(descriptors)?);
        let launcher: Arc<dyn AgentLauncher> = match (launcher, config.agents.launcher) {
            (Some(launcher), _) => launcher,
            (None, LauncherKind::Command) => Arc::new(CommandLauncher::new(
                agent_registry.clone(),
                config.ipc.socket_path.clone(),
            )),
            (None, LauncherKind::Simulated) => Arc::new(SimulatedLauncher::new(
                agent_registry.clone(),
                Duration::from_millis(config.agents.simulated_startup_ms),
                Duration::from_millis(config.agents.heartbeat_interval_ms),
            )),
        };
        let agents = LazyAgentLoader::new(
            agent_registry.clone(),
            graph,
            launcher,
            config.agents.to_activation_config(),
        );
        let (supervisor, supervisor_handle) =
            Supervisor::new(agents.clone(), config.agents.to_supervisor_config());

        let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config()));
        let rules = RuleSet::compile(
            &config.routing.rules,
            config.routing.default_complexity,
            config.routing.payload(),
        )?;
        let router = HybridRouter::new(
            rules,
            breakers.clone(),
            loader.clone(),
            config.routing.to_router_config(),
        )
        .with_agents(agents.clone());

        let collector = HealthCollector::new(loader.clone(), breakers.clone())
            .with_agents(agent_registry);

        tracing::info!(
            models = config.models.len(),
            agents = config.agents.catalog.len(),
            backends = config.backends.len(),
            rules = config.routing.rules.len(),
            "orchestrator built"
        );

        Ok(Self {
            config,
            loader,
            preloader,
            agents,
            router,
            breakers,
            collector,
            supervisor: Mutex::new(Some(supervisor)),
            supervisor_handle,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    pub fn agent_registry(&self) -> &Arc<AgentRegistry> {
        self.agents.registry()
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor_handle
    }

    /// Spawn the monitor, supervisor, health reporter and GC loops. The
    /// supervisor can only be started once; a second call skips it.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let monitor = VramMonitor::new(self.loader.clone(), self.config.eviction.to_monitor_config());
        tasks.push(tokio::spawn(monitor.run(cancel.clone())));

        if let Some(supervisor) = self.supervisor.lock().take() {
            tasks.push(tokio::spawn(supervisor.run(cancel.clone())));
        } else {
            tracing::warn!("supervisor already started");
        }

        let reporter = HealthReporter::new(
            self.collector.clone(),
            Duration::from_millis(self.config.health.interval_ms),
        )
        .with_sink(Arc::new(TracingSink));
        tasks.push(tokio::spawn(reporter.run(cancel.clone())));

        let this = Arc::clone(self);
        let period = Duration::from_millis(self.config.health.gc_interval_ms);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.collect_garbage(Instant::now());
                    }
                }
            }
        }));

        tasks
    }

    /// Drop quiet breakers and expired decision records.
    pub fn collect_garbage(&self, now: Instant) -> (usize, usize) {
        let breakers = self.breakers.gc(now);
        let decisions = self.router.purge_decisions(now);
        if breakers + decisions > 0 {
            tracing::debug!(breakers, decisions, "garbage collected");
        }
        (breakers, decisions)
    }

    pub async fn route(&self, task: &TaskRequest) -> Result<RouteDecision, RouteError> {
        self.router.route(task).await
    }

    /// Route, execute on the chosen backend and feed the outcome to its
    /// breaker. A required model is leased for the duration of the call.
    pub async fn dispatch(&self, task: &TaskRequest) -> Result<Dispatched, DispatchError> {
        let deadline = tokio::time::Instant::now() + task.deadline();
        let decision = self.router.route(task).await?;
        let backend = self
            .loader
            .backends()
            .get(&decision.backend_id)
            .ok_or_else(|| RouteError::UnknownBackend(decision.backend_id.clone()))?;

        let (_lease, handle) = match (&task.required_model, decision.model_handle) {
            (Some(model), Some(_)) => {
                let (lease, handle) = self
                    .loader
                    .acquire(model, deadline)
                    .await
                    .map_err(RouteError::from)?;
                (Some(lease), Some(handle))
            }
            _ => (None, None),
        };

        let result = tokio::time::timeout_at(deadline, backend.invoke(task, handle)).await;
        let backend_id = decision.backend_id.clone();
        match result {
            Ok(Ok(output)) => {
                self.router.record_outcome(&backend_id, Outcome::Success);
                Ok(Dispatched { decision, output })
            }
            Ok(Err(source)) => {
                self.router.record_outcome(&backend_id, Outcome::Failure);
                tracing::warn!(task = %task.id, backend = %backend_id, error = %source, "dispatch failed");
                Err(DispatchError::Backend {
                    backend: backend_id,
                    source,
                })
            }
            Err(_) => {
                self.router.record_outcome(&backend_id, Outcome::Timeout);
                Err(DispatchError::DeadlineExceeded(task.id.clone()))
            }
        }
    }

    pub async fn ensure(&self, agent: &AgentId, deadline: Duration) -> Result<Ready, ActivationError> {
        self.agents
            .ensure(agent, tokio::time::Instant::now() + deadline)
            .await
    }

    pub fn hint(&self, topic: &str, confidence: f64) -> HintOutcome {
        self.preloader.hint(topic, confidence)
    }

    pub fn heartbeat(&self, agent: &AgentId) -> Result<AgentState, AgentError> {
        self.agents.registry().heartbeat(agent)
    }

    /// Feed an externally observed dispatch outcome to the backend's breaker.
    pub fn record_outcome(&self, backend: &str, outcome: Outcome) -> CircuitState {
        self.router.record_outcome(backend, outcome);
        self.breakers.state(backend)
    }

    /// Demand load with the configured default timeout.
    pub async fn load(&self, model: &ModelId) -> Result<ModelHandle, LoadError> {
        let timeout = Duration::from_millis(self.config.loader.default_load_timeout_ms);
        self.loader.load(model, timeout).await
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.collector.collect()
    }
}
