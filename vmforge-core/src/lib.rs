//! Core types for the vmforge virtual-machine lifecycle controller
//!
//! This crate holds everything the controller shares with its callers and
//! with platform implementations: the error taxonomy, configuration, the
//! desired-state spec model and its parser, the hypervisor platform seam,
//! clock and cancellation abstractions, and the tracked-state store.

pub mod abstractions;
pub mod config;
pub mod error;
pub mod platform;
pub mod spec_parser;
pub mod state_store;
pub mod types;

pub use abstractions::{cancel_pair, CancelHandle, CancelToken, Clock, MockClock, SystemClock};
pub use config::ControllerConfig;
pub use error::{VmforgeError, VmforgeResult};
pub use platform::{HypervisorClient, PlatformError, PlatformResult};
pub use spec_parser::{SpecParser, VirtualMachineDocument};
pub use state_store::{MemoryStateStore, RedbStateStore, StateStore};
pub use types::{
    AdapterType, DiskSpec, LiveVirtualMachine, NetworkInterfaceSpec, TrackedVm,
    VirtualMachineSpec, VmHandle,
};
