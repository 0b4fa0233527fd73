//! User-facing VM documents and their conversion into [`VirtualMachineSpec`]
//!
//! A document mirrors the declarative schema users write (YAML or JSON).
//! [`SpecParser`] owns the injected defaults and turns a document into the
//! strongly typed spec the controller works with; the controller itself
//! never sees untyped input.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::debug;

use crate::config::VmDefaults;
use crate::error::{VmforgeError, VmforgeResult};
use crate::types::{AdapterType, DiskSpec, NetworkInterfaceSpec, VirtualMachineSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualMachineDocument {
    pub name: String,
    #[serde(default)]
    pub boot_delay: u64,
    pub vcpu: u32,
    /// Memory in MB
    pub memory: u64,
    #[serde(default)]
    pub datacenter: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub resource_pool: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub dns_suffix: Vec<String>,
    #[serde(default)]
    pub dns_server: Vec<String>,
    #[serde(default)]
    pub network_interface: Vec<NetworkInterfaceDocument>,
    #[serde(default)]
    pub disk: Vec<DiskDocument>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkInterfaceDocument {
    pub label: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub subnet_mask: Option<String>,
    #[serde(default)]
    pub adapter_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskDocument {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub datastore: Option<String>,
    /// Size in GB
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub iops: Option<u64>,
}

impl VirtualMachineDocument {
    pub fn from_yaml(content: &str) -> VmforgeResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> VmforgeResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Read a document, choosing the format from the file extension
    pub fn from_file(path: impl AsRef<Path>) -> VmforgeResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }
}

/// Converts documents into specs using injected defaults
#[derive(Debug, Clone, Default)]
pub struct SpecParser {
    defaults: VmDefaults,
}

impl SpecParser {
    pub fn new(defaults: VmDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &VmDefaults {
        &self.defaults
    }

    pub fn parse(&self, doc: &VirtualMachineDocument) -> VmforgeResult<VirtualMachineSpec> {
        let network_interfaces = doc
            .network_interface
            .iter()
            .enumerate()
            .map(|(i, nic)| parse_interface(i, nic))
            .collect::<VmforgeResult<Vec<_>>>()?;

        let hard_disks: Vec<DiskSpec> = doc
            .disk
            .iter()
            .map(|disk| DiskSpec {
                size_gb: disk.size,
                iops: disk.iops,
                datastore: non_empty(&disk.datastore),
                template: non_empty(&disk.template),
            })
            .collect();

        // Template and datastore are read from the first disk only
        let (template, datastore) = hard_disks
            .first()
            .map(|first| (first.template.clone(), first.datastore.clone()))
            .unwrap_or((None, None));

        let gateway = match non_empty(&doc.gateway) {
            Some(gw) => Some(parse_ipv4("gateway", &gw)?),
            None => None,
        };

        let spec = VirtualMachineSpec {
            name: doc.name.clone(),
            vcpu: doc.vcpu,
            memory_mb: doc.memory,
            boot_delay_secs: doc.boot_delay,
            datacenter: non_empty(&doc.datacenter),
            cluster: non_empty(&doc.cluster),
            resource_pool: non_empty(&doc.resource_pool),
            datastore,
            template,
            gateway,
            domain: non_empty(&doc.domain).unwrap_or_else(|| self.defaults.domain.clone()),
            time_zone: non_empty(&doc.time_zone)
                .unwrap_or_else(|| self.defaults.time_zone.clone()),
            dns_suffixes: or_default_list(&doc.dns_suffix, &self.defaults.dns_suffixes),
            dns_servers: or_default_list(&doc.dns_server, &self.defaults.dns_servers),
            network_interfaces,
            hard_disks,
        };

        spec.validate()?;
        debug!(vm = %spec.name, clone = spec.is_clone(), "parsed virtual machine spec");
        Ok(spec)
    }
}

fn parse_interface(index: usize, nic: &NetworkInterfaceDocument) -> VmforgeResult<NetworkInterfaceSpec> {
    let ip_address = match non_empty(&nic.ip_address) {
        Some(ip) => Some(parse_ipv4(&format!("network_interface.{}.ip_address", index), &ip)?),
        None => None,
    };
    let subnet_mask = match non_empty(&nic.subnet_mask) {
        Some(mask) => Some(parse_ipv4(
            &format!("network_interface.{}.subnet_mask", index),
            &mask,
        )?),
        None => None,
    };

    if ip_address.is_some() != subnet_mask.is_some() {
        return Err(VmforgeError::validation(
            format!("network_interface.{}", index),
            "ip_address and subnet_mask must be given together",
        ));
    }

    let adapter_type = match non_empty(&nic.adapter_type) {
        Some(kind) => Some(kind.parse::<AdapterType>().map_err(|_| {
            VmforgeError::validation(
                format!("network_interface.{}.adapter_type", index),
                format!("unknown adapter type '{}'", kind),
            )
        })?),
        None => None,
    };

    Ok(NetworkInterfaceSpec {
        label: nic.label.clone(),
        ip_address,
        subnet_mask,
        adapter_type,
    })
}

fn parse_ipv4(field: &str, value: &str) -> VmforgeResult<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| VmforgeError::validation(field, format!("'{}' is not an IPv4 address", value)))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn or_default_list(values: &[String], defaults: &[String]) -> Vec<String> {
    if values.is_empty() {
        defaults.to_vec()
    } else {
        values.to_vec()
    }
}
