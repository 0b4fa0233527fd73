pub mod orchestrator;

pub use orchestrator::VmforgeOrchestrator;

// Re-export commonly used types
pub use vmforge_core::{ControllerConfig, TrackedVm, VmforgeError, VmforgeResult};
