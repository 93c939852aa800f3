//! Model catalog, backends and the VRAM-aware lifecycle around them.

pub mod backend;
pub mod loader;
mod loader_types;
pub mod preloader;
pub mod registry;
mod registry_types;

pub use backend::{
    BackendError, BackendKind, BackendSet, InvokeOutput, ModelBackend, SimulatedBackend,
    SimulatedBackendConfig,
};
pub use loader::{LoadError, LoadPriority, LoaderConfig, LoaderMetrics, ModelLoader};
pub use preloader::{HintOutcome, Preloader, PreloaderConfig};
pub use registry::{
    ModelDescriptor, ModelHandle, ModelId, ModelLease, ModelRegistry, ModelState,
    ModelTransition, RegistryError,
};
