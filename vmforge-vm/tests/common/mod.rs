//! Shared fixtures for controller integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use vmforge_core::{
    abstractions::MockClock,
    config::ControllerConfig,
    spec_parser::{SpecParser, VirtualMachineDocument},
    types::VirtualMachineSpec,
};
use vmforge_vm::{SimulatedPlatform, VirtualMachineResource};

pub struct Harness {
    pub platform: Arc<SimulatedPlatform>,
    pub clock: MockClock,
    pub resource: VirtualMachineResource,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        Self::build(config, simulated::DEFAULT_LEASE_DELAY)
    }

    /// Guests report their address as soon as they boot
    pub fn instant_dhcp() -> Self {
        Self::build(ControllerConfig::default(), Duration::ZERO)
    }

    fn build(config: ControllerConfig, lease_delay: Duration) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let clock = MockClock::new();
        let platform = Arc::new(
            SimulatedPlatform::new(Arc::new(clock.clone())).with_lease_delay(lease_delay),
        );
        let resource =
            VirtualMachineResource::new(platform.clone(), Arc::new(clock.clone()), &config);
        Self {
            platform,
            clock,
            resource,
        }
    }
}

pub use vmforge_vm::simulated;

/// Parse a YAML document the way the CLI would
pub fn spec(yaml: &str) -> VirtualMachineSpec {
    let doc = VirtualMachineDocument::from_yaml(yaml).unwrap();
    SpecParser::default().parse(&doc).unwrap()
}

/// `vm1`: two vCPUs, 2 GiB, one 20 GB scratch disk, one DHCP NIC
pub fn vm1(boot_delay: u64) -> VirtualMachineSpec {
    spec(&format!(
        r#"
name: vm1
vcpu: 2
memory: 2048
boot_delay: {boot_delay}
network_interface:
  - label: eth0
disk:
  - size: 20
"#
    ))
}

pub fn named(name: &str) -> VirtualMachineSpec {
    let mut spec = vm1(0);
    spec.name = name.to_string();
    spec
}
