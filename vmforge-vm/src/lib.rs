//! Virtual-machine lifecycle controller
//!
//! Drives a [`HypervisorClient`](vmforge_core::platform::HypervisorClient)
//! through provisioning, post-boot convergence, reconciliation and teardown,
//! and exposes the whole lifecycle through [`VirtualMachineResource`].

pub mod convergence;
pub mod dhcp;
pub mod lookup;
pub mod mapping;
pub mod provisioning;
pub mod reconciler;
pub mod registry;
pub mod resource;
pub mod simulated;
pub mod task_runner;
pub mod teardown;

pub use convergence::{AddressHints, ConvergencePoller};
pub use provisioning::ProvisioningEngine;
pub use reconciler::{ReconcileOutcome, StateReconciler};
pub use registry::{PlatformFactory, PlatformRegistry, SimulatedPlatformFactory};
pub use resource::VirtualMachineResource;
pub use simulated::{FaultPoint, PlatformCall, SimulatedPlatform};
pub use task_runner::TaskRunner;
pub use teardown::TeardownSequencer;

// Re-export core types for convenience
pub use vmforge_core::{
    error::{VmforgeError, VmforgeResult},
    types::{LiveVirtualMachine, TrackedVm, VirtualMachineSpec, VmHandle},
};
