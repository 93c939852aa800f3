//! Predictive preloader: warm models ahead of demand from topic hints.
//!
//! A hint never blocks and never fails the request that produced it.
//! Loads issued here carry the predictive flag, so they are the first to
//! go under memory pressure and cannot displace demand-loaded models.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::loader::ModelLoader;
use super::registry::{ModelId, ModelState};

/// Preloader configuration.
#[derive(Debug, Clone)]
pub struct PreloaderConfig {
    /// Hints at or below this confidence are ignored.
    pub confidence_threshold: f64,
    /// Budget for each best-effort load.
    pub load_timeout: Duration,
    /// Topic name to the models it predicts.
    pub topics: HashMap<String, Vec<ModelId>>,
}

impl Default for PreloaderConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            load_timeout: Duration::from_secs(5),
            topics: HashMap::new(),
        }
    }
}

/// What a hint led to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintOutcome {
    /// Models a background load was started for.
    pub scheduled: Vec<ModelId>,
    /// Models already resident or loading.
    pub skipped: Vec<ModelId>,
}

pub struct Preloader {
    loader: ModelLoader,
    config: PreloaderConfig,
}

impl Preloader {
    pub fn new(loader: ModelLoader, config: PreloaderConfig) -> Self {
        Self { loader, config }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.config.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Consume a context signal. Must be called from within a tokio runtime.
    pub fn hint(&self, topic: &str, confidence: f64) -> HintOutcome {
        let mut outcome = HintOutcome::default();
        if !(confidence > self.config.confidence_threshold) {
            tracing::trace!(topic, confidence, "hint below threshold");
            return outcome;
        }
        let Some(models) = self.config.topics.get(topic) else {
            tracing::debug!(topic, "hint for unmapped topic");
            return outcome;
        };

        for model in models {
            match self.loader.registry().state(model) {
                Some(ModelState::Unloaded) | Some(ModelState::Failed) => {}
                Some(_) => {
                    outcome.skipped.push(model.clone());
                    continue;
                }
                None => {
                    tracing::warn!(topic, model = %model, "topic maps to unknown model");
                    continue;
                }
            }

            let loader = self.loader.clone();
            let timeout = self.config.load_timeout;
            let model_id = model.clone();
            tokio::spawn(async move {
                match loader.load_predictive(&model_id, timeout).await {
                    Ok(_) => tracing::debug!(model = %model_id, "predictive load complete"),
                    Err(e) => tracing::debug!(model = %model_id, error = %e, "predictive load dropped"),
                }
            });
            metrics::counter!("orchestrator_preloads_total").increment(1);
            outcome.scheduled.push(model.clone());
        }

        tracing::debug!(
            topic,
            confidence,
            scheduled = outcome.scheduled.len(),
            "preload hint handled"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vram_ledger::VramLedger;
    use crate::models::backend::{BackendKind, BackendSet, SimulatedBackend, SimulatedBackendConfig};
    use crate::models::loader::LoaderConfig;
    use crate::models::registry::{ModelDescriptor, ModelRegistry};
    use std::sync::Arc;

    fn preloader(capacity: u64, failure_rate: f64) -> (Preloader, Arc<SimulatedBackend>) {
        let backend = Arc::new(SimulatedBackend::with_config(
            "gpu0",
            BackendKind::LocalGpu,
            SimulatedBackendConfig {
                load_failure_rate: failure_rate,
                ..Default::default()
            },
        ));
        let registry = Arc::new(
            ModelRegistry::from_catalog([
                ModelDescriptor::new("whisper", "", 100, BackendKind::LocalGpu),
                ModelDescriptor::new("llava", "", 200, BackendKind::LocalGpu),
            ])
            .unwrap(),
        );
        let loader = ModelLoader::new(
            registry,
            Arc::new(VramLedger::new(capacity, 0).unwrap()),
            BackendSet::new().with(backend.clone()),
            LoaderConfig::default(),
        );
        let mut topics = HashMap::new();
        topics.insert(
            "speech".to_string(),
            vec![ModelId::from("whisper")],
        );
        topics.insert(
            "vision".to_string(),
            vec![ModelId::from("llava"), ModelId::from("ghost")],
        );
        let config = PreloaderConfig {
            topics,
            ..Default::default()
        };
        (Preloader::new(loader, config), backend)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_confident_hint_warms_model() {
        let (preloader, backend) = preloader(1000, 0.0);

        let outcome = preloader.hint("speech", 0.9);
        assert_eq!(outcome.scheduled, vec![ModelId::from("whisper")]);
        settle().await;

        assert_eq!(backend.load_count(), 1);
        let ledger = preloader.loader.ledger();
        assert!(ledger.is_predictive(&ModelId::from("whisper")));
    }

    #[tokio::test]
    async fn test_weak_or_unknown_hints_ignored() {
        let (preloader, backend) = preloader(1000, 0.0);

        assert!(preloader.hint("speech", 0.7).scheduled.is_empty());
        assert!(preloader.hint("cooking", 0.99).scheduled.is_empty());
        settle().await;
        assert_eq!(backend.load_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_models_in_topic_skipped() {
        let (preloader, _) = preloader(1000, 0.0);
        let outcome = preloader.hint("vision", 0.95);
        assert_eq!(outcome.scheduled, vec![ModelId::from("llava")]);
    }

    #[tokio::test]
    async fn test_resident_model_not_reloaded() {
        let (preloader, backend) = preloader(1000, 0.0);
        preloader.hint("speech", 0.9);
        settle().await;

        let outcome = preloader.hint("speech", 0.9);
        assert!(outcome.scheduled.is_empty());
        assert_eq!(outcome.skipped, vec![ModelId::from("whisper")]);
        assert_eq!(backend.load_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_preload_is_silent() {
        let (preloader, _) = preloader(1000, 1.0);
        let outcome = preloader.hint("speech", 0.9);
        assert_eq!(outcome.scheduled.len(), 1);
        settle().await;
        assert_eq!(
            preloader.loader.registry().state(&ModelId::from("whisper")),
            Some(ModelState::Failed)
        );
    }
}
