//! Translation of a [`VirtualMachineSpec`] into platform request types

use vmforge_core::{
    config::VmDefaults,
    platform::{
        CloneSpec, CustomizationSpec, DeviceChange, DiskDevice, ManagedObjectRef, NicDevice,
        NicIpSettings, RelocateSpec, VmConfigSpec,
    },
    types::{AdapterType, DiskSpec, NetworkInterfaceSpec, VirtualMachineSpec},
};

/// Hardware defaults applied while mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingOptions {
    pub default_adapter: AdapterType,
    pub thin_provisioned: bool,
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self::from(&VmDefaults::default())
    }
}

impl From<&VmDefaults> for MappingOptions {
    fn from(defaults: &VmDefaults) -> Self {
        Self {
            default_adapter: defaults.adapter_type,
            thin_provisioned: defaults.thin_provisioned,
        }
    }
}

impl MappingOptions {
    pub fn nic_device(&self, nic: &NetworkInterfaceSpec) -> NicDevice {
        NicDevice {
            network_label: nic.label.clone(),
            adapter_type: nic.adapter_type.unwrap_or(self.default_adapter),
        }
    }

    /// Disk device for a spec entry; size presence is checked by validation
    pub fn disk_device(&self, disk: &DiskSpec, datastore: Option<&ManagedObjectRef>) -> DiskDevice {
        DiskDevice {
            capacity_gb: disk.size_gb.unwrap_or_default(),
            iops_limit: disk.iops,
            datastore: datastore.cloned(),
            thin_provisioned: self.thin_provisioned,
        }
    }

    fn nic_changes(&self, spec: &VirtualMachineSpec) -> Vec<DeviceChange> {
        spec.network_interfaces
            .iter()
            .map(|nic| DeviceChange::AddNic(self.nic_device(nic)))
            .collect()
    }

    /// Full configuration for building a VM from scratch: boot disk,
    /// additional disks and every NIC, all on `datastore`
    pub fn create_config(
        &self,
        spec: &VirtualMachineSpec,
        datastore: &ManagedObjectRef,
    ) -> VmConfigSpec {
        let mut device_changes: Vec<DeviceChange> = spec
            .hard_disks
            .iter()
            .map(|disk| DeviceChange::AddDisk(self.disk_device(disk, Some(datastore))))
            .collect();
        device_changes.extend(self.nic_changes(spec));

        VmConfigSpec {
            name: Some(spec.name.clone()),
            num_cpus: Some(spec.vcpu),
            memory_mb: Some(spec.memory_mb),
            files_datastore: Some(datastore.clone()),
            device_changes,
        }
    }

    /// Clone request: the template supplies the primary disk, the spec
    /// overrides CPU, memory and NICs
    pub fn clone_spec(
        &self,
        spec: &VirtualMachineSpec,
        pool: &ManagedObjectRef,
        datastore: Option<&ManagedObjectRef>,
    ) -> CloneSpec {
        CloneSpec {
            name: spec.name.clone(),
            location: RelocateSpec {
                pool: pool.clone(),
                datastore: datastore.cloned(),
            },
            config: VmConfigSpec {
                name: Some(spec.name.clone()),
                num_cpus: Some(spec.vcpu),
                memory_mb: Some(spec.memory_mb),
                files_datastore: None,
                device_changes: self.nic_changes(spec),
            },
            power_on: false,
        }
    }

    /// Reconfiguration attaching every disk after the first, or `None`
    /// when there is nothing to add
    pub fn additional_disks_config(
        &self,
        spec: &VirtualMachineSpec,
        datastore: Option<&ManagedObjectRef>,
    ) -> Option<VmConfigSpec> {
        let extra = spec.additional_disks();
        if extra.is_empty() {
            return None;
        }

        Some(VmConfigSpec {
            device_changes: extra
                .iter()
                .map(|disk| DeviceChange::AddDisk(self.disk_device(disk, datastore)))
                .collect(),
            ..Default::default()
        })
    }
}

/// Reconfiguration of the mutable sizing fields only
pub fn resize_config(vcpu: u32, memory_mb: u64) -> VmConfigSpec {
    VmConfigSpec {
        num_cpus: Some(vcpu),
        memory_mb: Some(memory_mb),
        ..Default::default()
    }
}

/// Guest customization for a cloned VM
pub fn customization_spec(spec: &VirtualMachineSpec) -> CustomizationSpec {
    CustomizationSpec {
        hostname: spec.name.clone(),
        domain: spec.domain.clone(),
        time_zone: spec.time_zone.clone(),
        dns_suffixes: spec.dns_suffixes.clone(),
        dns_servers: spec.dns_servers.clone(),
        gateway: spec.gateway,
        nics: spec
            .network_interfaces
            .iter()
            .map(|nic| match (nic.ip_address, nic.subnet_mask) {
                (Some(ip_address), Some(subnet_mask)) => NicIpSettings::Static {
                    ip_address,
                    subnet_mask,
                },
                _ => NicIpSettings::Dhcp,
            })
            .collect(),
    }
}
