//! GG-ORCHESTRATOR: VRAM-aware model lifecycle and routing core.
//!
//! Decides which models occupy GPU memory, which agent processes are
//! alive, and whether each task runs on local hardware or a remote
//! backend. Components:
//!
//! - [`memory`]: VRAM ledger, eviction policy and the usage monitor
//! - [`models`]: catalog, single-flight loader and predictive preloader
//! - [`agents`]: dependency graph, lazy activation and supervision
//! - [`routing`]: complexity rules, circuit breakers and the hybrid router
//! - [`health`]: periodic per-model/agent health records
//! - [`ipc`]: control-plane protocol and Unix socket server
//! - [`orchestrator`]: wiring and background tasks

pub mod agents;
pub mod cli;
pub mod config;
pub mod health;
pub mod ipc;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod routing;

pub use config::{ConfigError, OrchestratorConfig};
pub use orchestrator::{BuildError, DispatchError, Dispatched, Orchestrator};
