//! VRAM lifecycle scenarios driven through the orchestrator.
//!
//! Ledger accounting under pressure, LRU eviction, pinned models and
//! randomized concurrent load/unload churn.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gg_orchestrator::memory::VramLedger;
use gg_orchestrator::models::{LoadError, ModelId, ModelState};
use gg_orchestrator::{Orchestrator, OrchestratorConfig};

const GB: u64 = 1 << 30;

fn config(models: &str) -> OrchestratorConfig {
    let text = format!(
        r#"
[vram]
total_bytes = {total}
reserved_bytes = {reserved}

[agents]
launcher = "simulated"

[routing]
local_backend = "gpu0"
heavy_backend = "cloud"

[[backends]]
id = "gpu0"
kind = "local-gpu"
load_latency_scale = 0.0

[[backends]]
id = "cloud"
kind = "remote"

{models}
"#,
        total = 8 * GB,
        reserved = GB,
        models = models,
    );
    let config = OrchestratorConfig::from_toml_str(&text).unwrap();
    config.validate().unwrap();
    config
}

fn gpu_model(name: &str, bytes: u64, pinned: bool) -> String {
    format!(
        "[[models]]\nname = \"{}\"\nsize_bytes = {}\nbackend = \"local-gpu\"\npinned = {}\n",
        name, bytes, pinned
    )
}

fn id(name: &str) -> ModelId {
    ModelId::from(name)
}

// ============================================================================
// Eviction under pressure
// ============================================================================

#[tokio::test]
async fn scenario_oldest_idle_model_evicted_for_new_load() {
    let models = [
        gpu_model("m1", 3 * GB, false),
        gpu_model("m2", 4 * GB, false),
        gpu_model("m3", 3 * GB, false),
        gpu_model("huge", 9 * GB, false),
    ]
    .concat();
    let orch = Orchestrator::build(config(&models)).unwrap();

    orch.load(&id("m1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    orch.load(&id("m2")).await.unwrap();
    assert_eq!(orch.loader().ledger().used_bytes(), 7 * GB);

    orch.load(&id("m3")).await.unwrap();

    let registry = orch.loader().registry();
    assert_eq!(registry.state(&id("m1")), Some(ModelState::Unloaded));
    assert_eq!(registry.state(&id("m2")), Some(ModelState::Resident));
    assert_eq!(registry.state(&id("m3")), Some(ModelState::Resident));
    assert_eq!(orch.loader().ledger().used_bytes(), 7 * GB);

    let err = orch.load(&id("huge")).await.unwrap_err();
    assert!(matches!(err, LoadError::InsufficientVram { requested, .. } if requested == 9 * GB));
    assert_eq!(registry.resident_count(), 2, "failed load must not evict");
}

#[tokio::test]
async fn scenario_pinned_model_survives_pressure() {
    let models = [
        gpu_model("base", 3 * GB, true),
        gpu_model("a", 4 * GB, false),
        gpu_model("b", 4 * GB, false),
    ]
    .concat();
    let orch = Orchestrator::build(config(&models)).unwrap();

    orch.load(&id("base")).await.unwrap();
    orch.load(&id("a")).await.unwrap();
    orch.load(&id("b")).await.unwrap();

    let registry = orch.loader().registry();
    assert_eq!(registry.state(&id("base")), Some(ModelState::Resident));
    assert_eq!(registry.state(&id("a")), Some(ModelState::Unloaded));
    assert_eq!(registry.state(&id("b")), Some(ModelState::Resident));
}

#[tokio::test]
async fn scenario_health_snapshot_tracks_ledger() {
    let orch = Orchestrator::build(config(&gpu_model("m", 2 * GB, false))).unwrap();
    orch.load(&id("m")).await.unwrap();

    let snapshot = orch.health_snapshot();
    let record = snapshot.records.iter().find(|r| r.id == "m").unwrap();
    assert_eq!(record.vram_bytes, 2 * GB);
    assert_eq!(record.state, "resident");
    assert_eq!(snapshot.budget.used_bytes, 2 * GB);
    assert_eq!(snapshot.budget.capacity(), 7 * GB);
}

// ============================================================================
// Ledger invariant under randomized concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_ledger_never_exceeds_capacity() {
    let ledger = Arc::new(VramLedger::new(8 * GB, GB).unwrap());
    let capacity = 7 * GB;

    let workers = (0..8u64).map(|w| {
        let ledger = ledger.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(w);
            for i in 0..200 {
                let bytes = rng.gen_range(1..=3 * GB);
                let model = ModelId::from(format!("w{}-{}", w, i).as_str());
                if let Ok(token) = ledger.reserve(&model, bytes, false) {
                    assert!(ledger.in_use_bytes() <= capacity);
                    if rng.gen_bool(0.5) {
                        ledger.commit(token).unwrap();
                        assert!(ledger.used_bytes() <= capacity);
                        tokio::task::yield_now().await;
                        assert_eq!(ledger.release(&model), Some(bytes));
                    } else {
                        ledger.rollback(token).unwrap();
                    }
                }
            }
        })
    });
    for handle in futures::future::join_all(workers).await {
        handle.unwrap();
    }

    assert_eq!(ledger.used_bytes(), 0);
    assert_eq!(ledger.pending_bytes(), 0);
}
