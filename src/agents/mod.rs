//! On-demand worker agents: registry, dependency graph, activation and
//! supervision.

pub mod graph;
pub mod launcher;
pub mod lazy_loader;
pub mod registry;
mod registry_types;
pub mod supervisor;

pub use graph::{AgentGraph, GraphError};
pub use launcher::{AgentLauncher, CommandLauncher, LaunchError, SimulatedLauncher};
pub use lazy_loader::{ActivationConfig, ActivationError, LazyAgentLoader, Ready};
pub use registry::{
    AgentDescriptor, AgentError, AgentId, AgentRegistry, AgentState, AgentTransition, LaunchSpec,
};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorConfig, SupervisorHandle};
