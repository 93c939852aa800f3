//! Periodic health push.
//!
//! Transport belongs to the collector; a sink only has to accept a
//! snapshot. A failing sink is logged and skipped, it never stops the loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::record::{HealthCollector, HealthSnapshot};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Sink rejected snapshot: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait HealthSink: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, snapshot: &HealthSnapshot) -> Result<(), SinkError>;
}

/// Emits one structured log event per record.
pub struct TracingSink;

#[async_trait]
impl HealthSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn push(&self, snapshot: &HealthSnapshot) -> Result<(), SinkError> {
        for record in &snapshot.records {
            tracing::info!(
                target: "gg_orchestrator::health",
                id = %record.id,
                kind = ?record.kind,
                state = %record.state,
                last_used_at = record.last_used_at.as_deref().unwrap_or("-"),
                vram_bytes = record.vram_bytes,
                breaker_state = record.breaker_state.map(|s| s.as_str()).unwrap_or("-"),
                "health record"
            );
        }
        tracing::info!(
            target: "gg_orchestrator::health",
            host = %snapshot.host,
            used_bytes = snapshot.budget.used_bytes,
            pending_bytes = snapshot.budget.pending_bytes,
            open_breakers = snapshot.open_breakers(),
            "health summary"
        );
        Ok(())
    }
}

/// Forwards snapshots to an in-process consumer.
pub struct ChannelSink {
    tx: mpsc::Sender<HealthSnapshot>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<HealthSnapshot>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl HealthSink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    async fn push(&self, snapshot: &HealthSnapshot) -> Result<(), SinkError> {
        self.tx
            .send(snapshot.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

pub struct HealthReporter {
    collector: HealthCollector,
    sinks: Vec<Arc<dyn HealthSink>>,
    interval: Duration,
}

impl HealthReporter {
    pub fn new(collector: HealthCollector, interval: Duration) -> Self {
        Self {
            collector,
            sinks: Vec::new(),
            interval,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn HealthSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Collect once and push to every sink. Returns how many accepted it.
    pub async fn report_once(&self) -> usize {
        let snapshot = self.collector.collect();
        let mut delivered = 0;
        for sink in &self.sinks {
            match sink.push(&snapshot).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(sink = sink.name(), error = %e, "health push failed"),
            }
        }
        delivered
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report_once().await;
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("health reporter stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VramLedger;
    use crate::models::{BackendSet, LoaderConfig, ModelLoader, ModelRegistry};
    use crate::routing::{BreakerConfig, BreakerRegistry};

    struct Refusing;

    #[async_trait]
    impl HealthSink for Refusing {
        fn name(&self) -> &str {
            "refusing"
        }

        async fn push(&self, _snapshot: &HealthSnapshot) -> Result<(), SinkError> {
            Err(SinkError::Rejected("collector down".into()))
        }
    }

    fn collector() -> HealthCollector {
        let loader = ModelLoader::new(
            Arc::new(ModelRegistry::new()),
            Arc::new(VramLedger::new(1_000, 0).unwrap()),
            BackendSet::new(),
            LoaderConfig::default(),
        );
        HealthCollector::new(loader, Arc::new(BreakerRegistry::new(BreakerConfig::default())))
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let (tx, mut rx) = mpsc::channel(4);
        let reporter = HealthReporter::new(collector(), Duration::from_secs(60))
            .with_sink(Arc::new(Refusing))
            .with_sink(Arc::new(TracingSink))
            .with_sink(Arc::new(ChannelSink::new(tx)));

        assert_eq!(reporter.report_once().await, 2);
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.budget.total_bytes, 1_000);
    }

    #[tokio::test]
    async fn test_run_pushes_until_cancelled() {
        let (tx, mut rx) = mpsc::channel(16);
        let reporter = HealthReporter::new(collector(), Duration::from_millis(10))
            .with_sink(Arc::new(ChannelSink::new(tx)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(reporter.run(cancel.clone()));

        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        cancel.cancel();
        task.await.unwrap();
    }
}
