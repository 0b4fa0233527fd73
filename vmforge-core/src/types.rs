use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{VmforgeError, VmforgeResult};
use crate::platform::{ManagedObjectRef, PowerState};

/// Key under which the guest address is published in connection info
pub const CONNECTION_HOST_KEY: &str = "host";

/// Desired state of a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineSpec {
    /// Unique within the datacenter, immutable once created
    pub name: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    /// Seconds after boot before the guest address is worth asking for
    pub boot_delay_secs: u64,
    pub datacenter: Option<String>,
    pub cluster: Option<String>,
    pub resource_pool: Option<String>,
    pub datastore: Option<String>,
    /// Source template; selects the clone path when present
    pub template: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub domain: String,
    pub time_zone: String,
    pub dns_suffixes: Vec<String>,
    pub dns_servers: Vec<String>,
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    pub hard_disks: Vec<DiskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceSpec {
    pub label: String,
    pub ip_address: Option<Ipv4Addr>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub adapter_type: Option<AdapterType>,
}

impl NetworkInterfaceSpec {
    pub fn dhcp(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ip_address: None,
            subnet_mask: None,
            adapter_type: None,
        }
    }

    pub fn with_static(label: impl Into<String>, ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self {
            label: label.into(),
            ip_address: Some(ip),
            subnet_mask: Some(mask),
            adapter_type: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Capacity in GB
    pub size_gb: Option<u64>,
    pub iops: Option<u64>,
    /// Only meaningful on the first disk
    pub datastore: Option<String>,
    /// Only meaningful on the first disk
    pub template: Option<String>,
}

impl DiskSpec {
    pub fn sized(size_gb: u64) -> Self {
        Self {
            size_gb: Some(size_gb),
            ..Default::default()
        }
    }
}

/// Virtual NIC hardware model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    E1000,
    E1000e,
    Vmxnet2,
    Vmxnet3,
}

impl AdapterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterType::E1000 => "e1000",
            AdapterType::E1000e => "e1000e",
            AdapterType::Vmxnet2 => "vmxnet2",
            AdapterType::Vmxnet3 => "vmxnet3",
        }
    }
}

impl std::fmt::Display for AdapterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterType {
    type Err = VmforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "e1000" => Ok(AdapterType::E1000),
            "e1000e" => Ok(AdapterType::E1000e),
            "vmxnet2" => Ok(AdapterType::Vmxnet2),
            "vmxnet3" => Ok(AdapterType::Vmxnet3),
            other => Err(VmforgeError::validation(
                "adapter_type",
                format!("unknown adapter type '{}'", other),
            )),
        }
    }
}

impl VirtualMachineSpec {
    /// Check the structural invariants that must hold before any platform call
    pub fn validate(&self) -> VmforgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(VmforgeError::validation("name", "must not be empty"));
        }
        if self.vcpu == 0 {
            return Err(VmforgeError::validation("vcpu", "must be greater than zero"));
        }
        if self.memory_mb == 0 {
            return Err(VmforgeError::validation(
                "memory",
                "must be greater than zero",
            ));
        }
        if self.network_interfaces.is_empty() {
            return Err(VmforgeError::validation(
                "network_interface",
                "at least one network interface is required",
            ));
        }
        for (i, nic) in self.network_interfaces.iter().enumerate() {
            if nic.label.trim().is_empty() {
                return Err(VmforgeError::validation(
                    format!("network_interface.{}.label", i),
                    "must not be empty",
                ));
            }
        }

        let (first, rest) = self.hard_disks.split_first().ok_or_else(|| {
            VmforgeError::validation("disk", "at least one disk is required")
        })?;

        if !self.is_clone() && !has_size(first) {
            return Err(VmforgeError::validation(
                "disk.0.size",
                "size is required when no template is given",
            ));
        }

        for (i, disk) in rest.iter().enumerate() {
            if !has_size(disk) {
                return Err(VmforgeError::validation(
                    format!("disk.{}.size", i + 1),
                    "size is required",
                ));
            }
        }

        Ok(())
    }

    pub fn is_clone(&self) -> bool {
        self.template.is_some()
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_secs(self.boot_delay_secs)
    }

    /// Static address of the first interface, if it declares one
    pub fn first_static_ip(&self) -> Option<Ipv4Addr> {
        self.network_interfaces.first().and_then(|nic| nic.ip_address)
    }

    /// Disks after the first one, which are always attached explicitly
    pub fn additional_disks(&self) -> &[DiskSpec] {
        self.hard_disks.get(1..).unwrap_or(&[])
    }
}

fn has_size(disk: &DiskSpec) -> bool {
    matches!(disk.size_gb, Some(size) if size > 0)
}

/// Opaque result of provisioning, enough to find the VM again
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmHandle {
    pub name: String,
    pub datacenter: String,
    pub reference: ManagedObjectRef,
}

/// Snapshot of platform truth for one VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveVirtualMachine {
    pub name: String,
    pub datacenter: String,
    pub memory_mb: u64,
    pub vcpu: u32,
    pub boot_time: Option<DateTime<Utc>>,
    pub power_state: PowerState,
    /// Absent while the VM is not running
    pub ip_address: Option<String>,
}

impl LiveVirtualMachine {
    /// Connection details for anything that needs to reach the guest;
    /// empty when there is no address to reach
    pub fn connection_info(&self) -> BTreeMap<String, String> {
        let mut info = BTreeMap::new();
        if let Some(ip) = &self.ip_address {
            info.insert(CONNECTION_HOST_KEY.to_string(), ip.clone());
        }
        info
    }
}

/// Record kept by the tracked-state store for one resource instance
///
/// An empty `id` means the resource is not (or no longer) known to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedVm {
    pub id: String,
    pub spec: VirtualMachineSpec,
    pub datacenter: Option<String>,
    pub memory_mb: Option<u64>,
    pub cpu: Option<u32>,
    pub ip_address: Option<String>,
    pub connection_info: BTreeMap<String, String>,
}

impl TrackedVm {
    /// A record for a freshly provisioned VM, identified by its name
    pub fn created(spec: VirtualMachineSpec) -> Self {
        Self {
            id: spec.name.clone(),
            spec,
            datacenter: None,
            memory_mb: None,
            cpu: None,
            ip_address: None,
            connection_info: BTreeMap::new(),
        }
    }

    pub fn is_tracked(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn apply_snapshot(&mut self, live: &LiveVirtualMachine) {
        self.datacenter = Some(live.datacenter.clone());
        self.memory_mb = Some(live.memory_mb);
        self.cpu = Some(live.vcpu);
        self.ip_address = live.ip_address.clone();
        self.connection_info = live.connection_info();
    }

    pub fn clear_identity(&mut self) {
        self.id.clear();
        self.connection_info.clear();
    }
}
