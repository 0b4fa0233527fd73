//! Hypervisor platform abstraction
//!
//! The controller never talks to a hypervisor SDK directly. Object lookup,
//! property collection and task submission are consumed through the
//! [`HypervisorClient`] trait, and the controller describes what it wants
//! with the plain request types defined here (config specs, clone specs,
//! guest customization). An implementation is assumed to be already
//! authenticated and safe to share across tasks working on different VMs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::types::AdapterType;

/// Errors reported by a platform implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("platform fault: {message}")]
    Fault { message: String },

    #[error("platform unavailable: {message}")]
    Unavailable { message: String },
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

impl PlatformError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        PlatformError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn task_failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        PlatformError::TaskFailed {
            task: task.into(),
            message: message.into(),
        }
    }

    pub fn fault(message: impl Into<String>) -> Self {
        PlatformError::Fault {
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}

/// Kind of managed object a reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Datacenter,
    VirtualMachine,
    ResourcePool,
    Datastore,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Datacenter => write!(f, "Datacenter"),
            ObjectKind::VirtualMachine => write!(f, "VirtualMachine"),
            ObjectKind::ResourcePool => write!(f, "ResourcePool"),
            ObjectKind::Datastore => write!(f, "Datastore"),
        }
    }
}

/// Opaque reference to a platform-side object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectRef {
    pub kind: ObjectKind,
    pub id: String,
}

impl ManagedObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ManagedObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A resolved datacenter, the search scope for VM lookups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datacenter {
    pub name: String,
    pub reference: ManagedObjectRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

/// The `summary` property bag of a virtual machine, fetched in one round trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSummary {
    pub name: String,
    pub memory_mb: u64,
    pub num_cpu: u32,
    pub power_state: PowerState,
    /// Absent while the VM has never been powered on
    pub boot_time: Option<DateTime<Utc>>,
    /// Guest-reported address; absent until VM tools report one
    pub guest_ip: Option<String>,
}

/// Long-running operations the controller submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Clone,
    Create,
    Reconfigure,
    Customize,
    PowerOn,
    PowerOff,
    Destroy,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Clone => "clone",
            TaskKind::Create => "create",
            TaskKind::Reconfigure => "reconfigure",
            TaskKind::Customize => "customize",
            TaskKind::PowerOn => "power-on",
            TaskKind::PowerOff => "power-off",
            TaskKind::Destroy => "destroy",
        }
    }

    pub fn is_teardown(&self) -> bool {
        matches!(self, TaskKind::PowerOff | TaskKind::Destroy)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two halves of every platform task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Submit,
    Wait,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPhase::Submit => write!(f, "submit"),
            TaskPhase::Wait => write!(f, "wait"),
        }
    }
}

/// Handle to a submitted task, passed back to `wait_for_task`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub id: String,
    pub kind: TaskKind,
}

/// Terminal state of a successful task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskResult {
    /// Object produced by the task (clone and create return the new VM)
    pub result: Option<ManagedObjectRef>,
}

/// A virtual disk to attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDevice {
    pub capacity_gb: u64,
    pub iops_limit: Option<u64>,
    pub datastore: Option<ManagedObjectRef>,
    pub thin_provisioned: bool,
}

/// A network adapter to attach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicDevice {
    pub network_label: String,
    pub adapter_type: AdapterType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceChange {
    AddDisk(DiskDevice),
    AddNic(NicDevice),
}

/// Hardware configuration for create and reconfigure tasks
///
/// `None` fields are left untouched by a reconfigure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfigSpec {
    pub name: Option<String>,
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    /// Datastore holding the VM's configuration files
    pub files_datastore: Option<ManagedObjectRef>,
    pub device_changes: Vec<DeviceChange>,
}

/// Placement of a clone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateSpec {
    pub pool: ManagedObjectRef,
    pub datastore: Option<ManagedObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub name: String,
    pub location: RelocateSpec,
    pub config: VmConfigSpec,
    pub power_on: bool,
}

/// Per-NIC addressing applied by guest customization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NicIpSettings {
    Dhcp,
    Static {
        ip_address: Ipv4Addr,
        subnet_mask: Ipv4Addr,
    },
}

/// Guest OS identity and network settings for a cloned VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomizationSpec {
    pub hostname: String,
    pub domain: String,
    pub time_zone: String,
    pub dns_suffixes: Vec<String>,
    pub dns_servers: Vec<String>,
    pub gateway: Option<Ipv4Addr>,
    pub nics: Vec<NicIpSettings>,
}

/// Authenticated handle to the hypervisor management API
///
/// Mutating calls only submit a task; completion is observed through
/// [`HypervisorClient::wait_for_task`].
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Resolve a datacenter by name, or the platform default when `None`
    async fn find_datacenter(&self, name: Option<&str>) -> PlatformResult<Datacenter>;

    /// Resolve a virtual machine by name inside a datacenter
    async fn find_vm(&self, datacenter: &Datacenter, name: &str)
        -> PlatformResult<ManagedObjectRef>;

    /// Resolve a template by name inside a datacenter
    async fn find_template(
        &self,
        datacenter: &Datacenter,
        name: &str,
    ) -> PlatformResult<ManagedObjectRef>;

    /// Resolve a resource pool; empty selectors pick the platform default
    async fn find_resource_pool(
        &self,
        datacenter: &Datacenter,
        cluster: Option<&str>,
        pool: Option<&str>,
    ) -> PlatformResult<ManagedObjectRef>;

    /// Resolve a datastore by name, or the platform default when `None`
    async fn find_datastore(
        &self,
        datacenter: &Datacenter,
        name: Option<&str>,
    ) -> PlatformResult<ManagedObjectRef>;

    async fn retrieve_summary(&self, vm: &ManagedObjectRef) -> PlatformResult<VmSummary>;

    async fn clone_vm(
        &self,
        template: &ManagedObjectRef,
        spec: &CloneSpec,
    ) -> PlatformResult<TaskHandle>;

    async fn create_vm(
        &self,
        datacenter: &Datacenter,
        pool: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> PlatformResult<TaskHandle>;

    async fn reconfigure_vm(
        &self,
        vm: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> PlatformResult<TaskHandle>;

    async fn customize_vm(
        &self,
        vm: &ManagedObjectRef,
        spec: &CustomizationSpec,
    ) -> PlatformResult<TaskHandle>;

    async fn power_on(&self, vm: &ManagedObjectRef) -> PlatformResult<TaskHandle>;

    async fn power_off(&self, vm: &ManagedObjectRef) -> PlatformResult<TaskHandle>;

    async fn destroy_vm(&self, vm: &ManagedObjectRef) -> PlatformResult<TaskHandle>;

    /// Block until the task reaches a terminal state
    async fn wait_for_task(&self, task: &TaskHandle) -> PlatformResult<TaskResult>;
}
