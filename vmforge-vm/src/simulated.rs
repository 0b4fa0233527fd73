//! Simulated hypervisor platform
//!
//! An in-memory inventory of datacenters, pools, datastores, templates and
//! VMs that implements [`HypervisorClient`]. Submitted tasks are queued and
//! take effect when they are waited on, the way a real task only completes
//! on the platform side. Every call is recorded in order so tests can
//! assert counts and sequencing, and faults can be injected at any lookup,
//! retrieval, submit or wait.
//!
//! Guest networking: powering on leases an address (the first static NIC
//! address from guest customization, otherwise one from a DHCP pool), which
//! the guest reports once the lease delay has passed since boot.
//!
//! With a database attached, the inventory survives process restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use vmforge_core::{
    abstractions::Clock,
    error::VmforgeResult,
    platform::{
        CloneSpec, CustomizationSpec, Datacenter, DeviceChange, DiskDevice, HypervisorClient,
        ManagedObjectRef, NicDevice, NicIpSettings, ObjectKind, PlatformError, PlatformResult,
        PowerState, TaskHandle, TaskKind, TaskResult, VmConfigSpec, VmSummary,
    },
    types::AdapterType,
};

use crate::dhcp::LeasePool;

pub const SIMULATED_INVENTORY_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("simulated_inventory");
const INVENTORY_KEY: &str = "inventory";

pub const DEFAULT_DATACENTER: &str = "dc1";
pub const DEFAULT_CLUSTER: &str = "cluster1";
pub const DEFAULT_RESOURCE_POOL: &str = "Resources";
pub const DEFAULT_DATASTORE: &str = "datastore1";
pub const DEFAULT_TEMPLATE: &str = "ubuntu-22.04-template";
pub const DEFAULT_LEASE_DELAY: Duration = Duration::from_secs(10);

/// One recorded call against the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    FindDatacenter(Option<String>),
    FindVm(String),
    FindTemplate(String),
    FindResourcePool {
        cluster: Option<String>,
        pool: Option<String>,
    },
    FindDatastore(Option<String>),
    RetrieveSummary(String),
    Submit { kind: TaskKind, vm: String },
    Wait { kind: TaskKind, vm: String },
}

/// Where an injected fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    FindDatacenter,
    FindVm,
    FindTemplate,
    RetrieveSummary,
    Submit(TaskKind),
    Wait(TaskKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedVm {
    pub id: String,
    pub name: String,
    pub datacenter: String,
    pub is_template: bool,
    pub num_cpu: u32,
    pub memory_mb: u64,
    pub power_state: PowerState,
    pub boot_time: Option<DateTime<Utc>>,
    pub disks: Vec<DiskDevice>,
    pub nics: Vec<NicDevice>,
    pub customization: Option<CustomizationSpec>,
    /// Address the guest reports once its network is up
    pub lease: Option<Ipv4Addr>,
    /// Whether `lease` came from the DHCP pool
    pub leased_from_pool: bool,
}

impl SimulatedVm {
    fn reference(&self) -> ManagedObjectRef {
        ManagedObjectRef::new(ObjectKind::VirtualMachine, self.id.clone())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DatacenterInventory {
    clusters: Vec<String>,
    resource_pools: Vec<String>,
    datastores: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Inventory {
    default_datacenter: String,
    datacenters: BTreeMap<String, DatacenterInventory>,
    /// Keyed by VM id
    vms: BTreeMap<String, SimulatedVm>,
    next_vm_id: u64,
    leases: LeasePool,
}

impl Inventory {
    fn seeded() -> Self {
        let mut inventory = Self {
            default_datacenter: DEFAULT_DATACENTER.to_string(),
            datacenters: BTreeMap::new(),
            vms: BTreeMap::new(),
            next_vm_id: 1,
            leases: LeasePool::default(),
        };
        inventory.add_datacenter(DEFAULT_DATACENTER);
        inventory.add_template(DEFAULT_DATACENTER, DEFAULT_TEMPLATE);
        inventory
    }

    fn add_datacenter(&mut self, name: &str) {
        self.datacenters.insert(
            name.to_string(),
            DatacenterInventory {
                clusters: vec![DEFAULT_CLUSTER.to_string()],
                resource_pools: vec![DEFAULT_RESOURCE_POOL.to_string()],
                datastores: vec![DEFAULT_DATASTORE.to_string()],
            },
        );
    }

    fn add_template(&mut self, datacenter: &str, name: &str) -> ManagedObjectRef {
        let id = self.allocate_id();
        let template = SimulatedVm {
            id: id.clone(),
            name: name.to_string(),
            datacenter: datacenter.to_string(),
            is_template: true,
            num_cpu: 2,
            memory_mb: 2048,
            power_state: PowerState::PoweredOff,
            boot_time: None,
            disks: vec![DiskDevice {
                capacity_gb: 16,
                iops_limit: None,
                datastore: None,
                thin_provisioned: true,
            }],
            nics: vec![NicDevice {
                network_label: "VM Network".to_string(),
                adapter_type: AdapterType::Vmxnet3,
            }],
            customization: None,
            lease: None,
            leased_from_pool: false,
        };
        let reference = template.reference();
        self.vms.insert(id, template);
        reference
    }

    fn allocate_id(&mut self) -> String {
        let id = format!("vm-{}", self.next_vm_id);
        self.next_vm_id += 1;
        id
    }

    fn datacenter(&self, name: &str) -> PlatformResult<&DatacenterInventory> {
        self.datacenters
            .get(name)
            .ok_or_else(|| PlatformError::not_found(ObjectKind::Datacenter.to_string(), name))
    }

    fn find_by_name(&self, datacenter: &str, name: &str) -> Option<&SimulatedVm> {
        self.vms
            .values()
            .find(|vm| vm.datacenter == datacenter && vm.name == name)
    }

    fn vm(&self, id: &str) -> PlatformResult<&SimulatedVm> {
        self.vms
            .get(id)
            .ok_or_else(|| PlatformError::not_found(ObjectKind::VirtualMachine.to_string(), id))
    }

    fn vm_mut(&mut self, id: &str) -> PlatformResult<&mut SimulatedVm> {
        self.vms
            .get_mut(id)
            .ok_or_else(|| PlatformError::not_found(ObjectKind::VirtualMachine.to_string(), id))
    }

    fn ensure_unique(&self, task: TaskKind, datacenter: &str, name: &str) -> PlatformResult<()> {
        if self.find_by_name(datacenter, name).is_some() {
            return Err(PlatformError::task_failed(
                task.as_str(),
                format!("a virtual machine named '{}' already exists", name),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PendingTask {
    Clone {
        template_id: String,
        spec: CloneSpec,
    },
    Create {
        datacenter: String,
        spec: VmConfigSpec,
    },
    Reconfigure {
        vm_id: String,
        spec: VmConfigSpec,
    },
    Customize {
        vm_id: String,
        spec: CustomizationSpec,
    },
    PowerOn {
        vm_id: String,
    },
    PowerOff {
        vm_id: String,
    },
    Destroy {
        vm_id: String,
    },
}

struct QueuedTask {
    kind: TaskKind,
    vm_name: String,
    task: PendingTask,
}

struct Fault {
    point: FaultPoint,
    remaining: u32,
    error: PlatformError,
}

/// Test-facing state that is never persisted
#[derive(Default)]
struct Runtime {
    calls: Vec<PlatformCall>,
    faults: Vec<Fault>,
    tasks: HashMap<String, QueuedTask>,
    scripted_ips: HashMap<String, VecDeque<Option<String>>>,
    stalled: HashSet<TaskKind>,
}

impl Runtime {
    fn record(&mut self, call: PlatformCall) {
        self.calls.push(call);
    }

    fn take_fault(&mut self, point: FaultPoint) -> PlatformResult<()> {
        let Some(index) = self.faults.iter().position(|f| f.point == point) else {
            return Ok(());
        };

        let fault = &mut self.faults[index];
        fault.remaining = fault.remaining.saturating_sub(1);
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        debug!(?point, error = %error, "simulated: injecting fault");
        Err(error)
    }

    /// The last scripted value sticks once the queue runs down
    fn scripted_ip(&mut self, name: &str) -> Option<Option<String>> {
        let queue = self.scripted_ips.get_mut(name)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

struct SimulatedState {
    inventory: Inventory,
    runtime: Runtime,
}

pub struct SimulatedPlatform {
    state: Mutex<SimulatedState>,
    clock: Arc<dyn Clock>,
    lease_delay: Duration,
    database: Option<Arc<Database>>,
}

impl SimulatedPlatform {
    /// Fresh in-memory platform with the default datacenter and template
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                inventory: Inventory::seeded(),
                runtime: Runtime::default(),
            }),
            clock,
            lease_delay: DEFAULT_LEASE_DELAY,
            database: None,
        }
    }

    /// Platform whose inventory is loaded from and written back to `database`
    pub fn persistent(database: Arc<Database>, clock: Arc<dyn Clock>) -> VmforgeResult<Self> {
        let write_txn = database.begin_write()?;
        let stored = {
            let table = write_txn.open_table(SIMULATED_INVENTORY_TABLE)?;
            let stored = match table.get(INVENTORY_KEY)? {
                Some(data) => Some(serde_json::from_slice::<Inventory>(data.value())?),
                None => None,
            };
            stored
        };
        write_txn.commit()?;

        let inventory = match stored {
            Some(inventory) => {
                info!(vms = inventory.vms.len(), "simulated: loaded inventory");
                inventory
            }
            None => {
                let inventory = Inventory::seeded();
                write_inventory(&database, &inventory)?;
                inventory
            }
        };

        Ok(Self {
            state: Mutex::new(SimulatedState {
                inventory,
                runtime: Runtime::default(),
            }),
            clock,
            lease_delay: DEFAULT_LEASE_DELAY,
            database: Some(database),
        })
    }

    /// Time between power-on and the guest reporting its address
    pub fn with_lease_delay(mut self, lease_delay: Duration) -> Self {
        self.lease_delay = lease_delay;
        self
    }

    pub fn add_datacenter(&self, name: &str) {
        self.state.lock().inventory.add_datacenter(name);
    }

    pub fn add_template(&self, datacenter: &str, name: &str) -> ManagedObjectRef {
        self.state.lock().inventory.add_template(datacenter, name)
    }

    /// Place a running VM in the default datacenter, bypassing tasks
    pub fn seed_powered_on(&self, name: &str) -> PlatformResult<ManagedObjectRef> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let inventory = &mut state.inventory;
        let datacenter = inventory.default_datacenter.clone();
        inventory.ensure_unique(TaskKind::Create, &datacenter, name)?;

        let lease = inventory.leases.lease()?;
        let id = inventory.allocate_id();
        let vm = SimulatedVm {
            id: id.clone(),
            name: name.to_string(),
            datacenter,
            is_template: false,
            num_cpu: 1,
            memory_mb: 1024,
            power_state: PowerState::PoweredOn,
            boot_time: Some(now),
            disks: Vec::new(),
            nics: Vec::new(),
            customization: None,
            lease: Some(lease),
            leased_from_pool: true,
        };
        let reference = vm.reference();
        inventory.vms.insert(id, vm);
        self.persist(&state.inventory)?;
        Ok(reference)
    }

    /// Delete a VM behind the controller's back
    pub fn remove_vm(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        let inventory = &mut state.inventory;
        let Some(id) = inventory
            .vms
            .values()
            .find(|vm| vm.name == name && !vm.is_template)
            .map(|vm| vm.id.clone())
        else {
            return false;
        };

        if let Some(vm) = inventory.vms.remove(&id) {
            if let (Some(ip), true) = (vm.lease, vm.leased_from_pool) {
                inventory.leases.release(ip);
            }
        }
        true
    }

    pub fn vm(&self, name: &str) -> Option<SimulatedVm> {
        let state = self.state.lock();
        state
            .inventory
            .vms
            .values()
            .find(|vm| vm.name == name && !vm.is_template)
            .cloned()
    }

    pub fn vms(&self) -> Vec<SimulatedVm> {
        let state = self.state.lock();
        state
            .inventory
            .vms
            .values()
            .filter(|vm| !vm.is_template)
            .cloned()
            .collect()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().runtime.calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().runtime.calls.clear();
    }

    pub fn summary_retrievals(&self, name: &str) -> usize {
        self.state
            .lock()
            .runtime
            .calls
            .iter()
            .filter(|call| matches!(call, PlatformCall::RetrieveSummary(vm) if vm == name))
            .count()
    }

    /// Kinds of every submitted task, in order
    pub fn submitted_tasks(&self) -> Vec<TaskKind> {
        self.state
            .lock()
            .runtime
            .calls
            .iter()
            .filter_map(|call| match call {
                PlatformCall::Submit { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn fail_next(&self, point: FaultPoint, error: PlatformError) {
        self.fail_times(point, 1, error);
    }

    pub fn fail_times(&self, point: FaultPoint, times: u32, error: PlatformError) {
        if times == 0 {
            return;
        }
        self.state.lock().runtime.faults.push(Fault {
            point,
            remaining: times,
            error,
        });
    }

    /// Guest addresses reported by successive summary retrievals of `name`
    ///
    /// `None` reports no address. The last entry repeats once the others
    /// are used up.
    pub fn script_guest_ips<'a, I>(&self, name: &str, ips: I)
    where
        I: IntoIterator<Item = Option<&'a str>>,
    {
        let queue = ips
            .into_iter()
            .map(|ip| ip.map(str::to_string))
            .collect();
        self.state
            .lock()
            .runtime
            .scripted_ips
            .insert(name.to_string(), queue);
    }

    /// Tasks of `kind` never complete once waited on
    pub fn stall_waits(&self, kind: TaskKind) {
        self.state.lock().runtime.stalled.insert(kind);
    }

    fn persist(&self, inventory: &Inventory) -> PlatformResult<()> {
        match &self.database {
            Some(database) => write_inventory(database, inventory).map_err(|e| {
                PlatformError::fault(format!("persisting simulated inventory: {}", e))
            }),
            None => Ok(()),
        }
    }

    fn submit(&self, kind: TaskKind, vm_name: String, task: PendingTask) -> PlatformResult<TaskHandle> {
        let mut state = self.state.lock();
        state.runtime.record(PlatformCall::Submit {
            kind,
            vm: vm_name.clone(),
        });
        state.runtime.take_fault(FaultPoint::Submit(kind))?;

        match &task {
            PendingTask::Clone { template_id, .. } => {
                state.inventory.vm(template_id)?;
            }
            PendingTask::Create { datacenter, .. } => {
                state.inventory.datacenter(datacenter)?;
            }
            PendingTask::Reconfigure { vm_id, .. }
            | PendingTask::Customize { vm_id, .. }
            | PendingTask::PowerOn { vm_id }
            | PendingTask::PowerOff { vm_id }
            | PendingTask::Destroy { vm_id } => {
                state.inventory.vm(vm_id)?;
            }
        }

        let id = format!("task-{}", Uuid::new_v4());
        debug!(task = %kind, task_id = %id, vm = %vm_name, "simulated: task submitted");
        state.runtime.tasks.insert(
            id.clone(),
            QueuedTask {
                kind,
                vm_name,
                task,
            },
        );
        Ok(TaskHandle { id, kind })
    }

    fn vm_name(&self, vm: &ManagedObjectRef) -> String {
        let state = self.state.lock();
        state
            .inventory
            .vms
            .get(&vm.id)
            .map(|found| found.name.clone())
            .unwrap_or_else(|| vm.id.clone())
    }

    fn apply(&self, inventory: &mut Inventory, task: PendingTask) -> PlatformResult<TaskResult> {
        let now = self.clock.now();
        match task {
            PendingTask::Clone { template_id, spec } => {
                let template = inventory.vm(&template_id)?.clone();
                inventory.ensure_unique(TaskKind::Clone, &template.datacenter, &spec.name)?;

                let mut disks = template.disks.clone();
                if let Some(datastore) = &spec.location.datastore {
                    for disk in &mut disks {
                        disk.datastore = Some(datastore.clone());
                    }
                }
                let mut nics = Vec::new();
                for change in &spec.config.device_changes {
                    match change {
                        DeviceChange::AddDisk(disk) => disks.push(disk.clone()),
                        DeviceChange::AddNic(nic) => nics.push(nic.clone()),
                    }
                }
                if nics.is_empty() {
                    nics = template.nics.clone();
                }

                let id = inventory.allocate_id();
                let vm = SimulatedVm {
                    id: id.clone(),
                    name: spec.name.clone(),
                    datacenter: template.datacenter.clone(),
                    is_template: false,
                    num_cpu: spec.config.num_cpus.unwrap_or(template.num_cpu),
                    memory_mb: spec.config.memory_mb.unwrap_or(template.memory_mb),
                    power_state: PowerState::PoweredOff,
                    boot_time: None,
                    disks,
                    nics,
                    customization: None,
                    lease: None,
                    leased_from_pool: false,
                };
                let reference = vm.reference();
                inventory.vms.insert(id.clone(), vm);
                info!(vm = %spec.name, template = %template.name, "simulated: cloned");

                if spec.power_on {
                    power_on(inventory, &id, now)?;
                }
                Ok(TaskResult {
                    result: Some(reference),
                })
            }
            PendingTask::Create { datacenter, spec } => {
                let name = spec.name.clone().ok_or_else(|| {
                    PlatformError::task_failed(TaskKind::Create.as_str(), "config spec has no name")
                })?;
                let (num_cpu, memory_mb) = match (spec.num_cpus, spec.memory_mb) {
                    (Some(cpu), Some(memory)) if cpu > 0 && memory > 0 => (cpu, memory),
                    _ => {
                        return Err(PlatformError::task_failed(
                            TaskKind::Create.as_str(),
                            "config spec needs CPU and memory",
                        ))
                    }
                };
                inventory.ensure_unique(TaskKind::Create, &datacenter, &name)?;

                let (disks, nics) = split_devices(&spec.device_changes);
                let id = inventory.allocate_id();
                let vm = SimulatedVm {
                    id: id.clone(),
                    name: name.clone(),
                    datacenter,
                    is_template: false,
                    num_cpu,
                    memory_mb,
                    power_state: PowerState::PoweredOff,
                    boot_time: None,
                    disks,
                    nics,
                    customization: None,
                    lease: None,
                    leased_from_pool: false,
                };
                let reference = vm.reference();
                inventory.vms.insert(id, vm);
                info!(vm = %name, "simulated: created");
                Ok(TaskResult {
                    result: Some(reference),
                })
            }
            PendingTask::Reconfigure { vm_id, spec } => {
                let vm = inventory.vm_mut(&vm_id)?;
                if let Some(cpu) = spec.num_cpus {
                    vm.num_cpu = cpu;
                }
                if let Some(memory) = spec.memory_mb {
                    vm.memory_mb = memory;
                }
                let (disks, nics) = split_devices(&spec.device_changes);
                vm.disks.extend(disks);
                vm.nics.extend(nics);
                info!(vm = %vm.name, cpu = vm.num_cpu, memory_mb = vm.memory_mb, "simulated: reconfigured");
                Ok(TaskResult::default())
            }
            PendingTask::Customize { vm_id, spec } => {
                let vm = inventory.vm_mut(&vm_id)?;
                if vm.power_state != PowerState::PoweredOff {
                    return Err(PlatformError::task_failed(
                        TaskKind::Customize.as_str(),
                        "guest customization requires a powered-off virtual machine",
                    ));
                }
                vm.customization = Some(spec);
                info!(vm = %vm.name, "simulated: customized");
                Ok(TaskResult::default())
            }
            PendingTask::PowerOn { vm_id } => {
                power_on(inventory, &vm_id, now)?;
                Ok(TaskResult::default())
            }
            PendingTask::PowerOff { vm_id } => {
                let vm = inventory.vm_mut(&vm_id)?;
                if vm.power_state == PowerState::PoweredOff {
                    debug!(vm = %vm.name, "simulated: already powered off");
                    return Ok(TaskResult::default());
                }
                vm.power_state = PowerState::PoweredOff;
                vm.boot_time = None;
                let released = vm.lease.take().filter(|_| vm.leased_from_pool);
                vm.leased_from_pool = false;
                info!(vm = %vm.name, "simulated: powered off");
                if let Some(ip) = released {
                    inventory.leases.release(ip);
                }
                Ok(TaskResult::default())
            }
            PendingTask::Destroy { vm_id } => {
                let vm = inventory.vm(&vm_id)?;
                if vm.power_state != PowerState::PoweredOff {
                    return Err(PlatformError::task_failed(
                        TaskKind::Destroy.as_str(),
                        format!("virtual machine '{}' is still powered on", vm.name),
                    ));
                }
                if let Some(vm) = inventory.vms.remove(&vm_id) {
                    info!(vm = %vm.name, "simulated: destroyed");
                }
                Ok(TaskResult::default())
            }
        }
    }

    fn guest_ip(&self, vm: &SimulatedVm, now: DateTime<Utc>) -> Option<String> {
        if vm.power_state != PowerState::PoweredOn {
            return None;
        }
        let up = (now - vm.boot_time?).to_std().unwrap_or(Duration::ZERO);
        if up < self.lease_delay {
            return None;
        }
        vm.lease.map(|ip| ip.to_string())
    }
}

fn split_devices(changes: &[DeviceChange]) -> (Vec<DiskDevice>, Vec<NicDevice>) {
    let mut disks = Vec::new();
    let mut nics = Vec::new();
    for change in changes {
        match change {
            DeviceChange::AddDisk(disk) => disks.push(disk.clone()),
            DeviceChange::AddNic(nic) => nics.push(nic.clone()),
        }
    }
    (disks, nics)
}

fn power_on(inventory: &mut Inventory, vm_id: &str, now: DateTime<Utc>) -> PlatformResult<()> {
    let static_ip = inventory.vm(vm_id)?.customization.as_ref().and_then(|custom| {
        custom.nics.iter().find_map(|nic| match nic {
            NicIpSettings::Static { ip_address, .. } => Some(*ip_address),
            NicIpSettings::Dhcp => None,
        })
    });

    if inventory.vm(vm_id)?.power_state == PowerState::PoweredOn {
        return Ok(());
    }

    let (lease, from_pool) = match static_ip {
        Some(ip) => (ip, false),
        None => (inventory.leases.lease()?, true),
    };

    let vm = inventory.vm_mut(vm_id)?;
    vm.power_state = PowerState::PoweredOn;
    vm.boot_time = Some(now);
    vm.lease = Some(lease);
    vm.leased_from_pool = from_pool;
    info!(vm = %vm.name, ip = %lease, "simulated: powered on");
    Ok(())
}

fn write_inventory(database: &Database, inventory: &Inventory) -> VmforgeResult<()> {
    let data = serde_json::to_vec(inventory)?;
    let write_txn = database.begin_write()?;
    {
        let mut table = write_txn.open_table(SIMULATED_INVENTORY_TABLE)?;
        table.insert(INVENTORY_KEY, data.as_slice())?;
    }
    write_txn.commit()?;
    Ok(())
}

#[async_trait]
impl HypervisorClient for SimulatedPlatform {
    async fn find_datacenter(&self, name: Option<&str>) -> PlatformResult<Datacenter> {
        let mut state = self.state.lock();
        state
            .runtime
            .record(PlatformCall::FindDatacenter(name.map(str::to_string)));
        state.runtime.take_fault(FaultPoint::FindDatacenter)?;

        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| state.inventory.default_datacenter.clone());
        state.inventory.datacenter(&name)?;
        Ok(Datacenter {
            reference: ManagedObjectRef::new(ObjectKind::Datacenter, name.clone()),
            name,
        })
    }

    async fn find_vm(&self, datacenter: &Datacenter, name: &str) -> PlatformResult<ManagedObjectRef> {
        let mut state = self.state.lock();
        state.runtime.record(PlatformCall::FindVm(name.to_string()));
        state.runtime.take_fault(FaultPoint::FindVm)?;

        state
            .inventory
            .find_by_name(&datacenter.name, name)
            .filter(|vm| !vm.is_template)
            .map(SimulatedVm::reference)
            .ok_or_else(|| PlatformError::not_found(ObjectKind::VirtualMachine.to_string(), name))
    }

    async fn find_template(
        &self,
        datacenter: &Datacenter,
        name: &str,
    ) -> PlatformResult<ManagedObjectRef> {
        let mut state = self.state.lock();
        state.runtime.record(PlatformCall::FindTemplate(name.to_string()));
        state.runtime.take_fault(FaultPoint::FindTemplate)?;

        state
            .inventory
            .find_by_name(&datacenter.name, name)
            .map(SimulatedVm::reference)
            .ok_or_else(|| PlatformError::not_found("Template", name))
    }

    async fn find_resource_pool(
        &self,
        datacenter: &Datacenter,
        cluster: Option<&str>,
        pool: Option<&str>,
    ) -> PlatformResult<ManagedObjectRef> {
        let mut state = self.state.lock();
        state.runtime.record(PlatformCall::FindResourcePool {
            cluster: cluster.map(str::to_string),
            pool: pool.map(str::to_string),
        });

        let inventory = state.inventory.datacenter(&datacenter.name)?;
        if let Some(cluster) = cluster {
            if !inventory.clusters.iter().any(|c| c == cluster) {
                return Err(PlatformError::not_found("Cluster", cluster));
            }
        }
        let pool = match pool {
            Some(pool) => inventory
                .resource_pools
                .iter()
                .find(|p| p.as_str() == pool)
                .ok_or_else(|| PlatformError::not_found(ObjectKind::ResourcePool.to_string(), pool))?,
            None => inventory.resource_pools.first().ok_or_else(|| {
                PlatformError::not_found(ObjectKind::ResourcePool.to_string(), "default")
            })?,
        };
        Ok(ManagedObjectRef::new(
            ObjectKind::ResourcePool,
            format!("{}/{}", datacenter.name, pool),
        ))
    }

    async fn find_datastore(
        &self,
        datacenter: &Datacenter,
        name: Option<&str>,
    ) -> PlatformResult<ManagedObjectRef> {
        let mut state = self.state.lock();
        state
            .runtime
            .record(PlatformCall::FindDatastore(name.map(str::to_string)));

        let inventory = state.inventory.datacenter(&datacenter.name)?;
        let datastore = match name {
            Some(name) => inventory
                .datastores
                .iter()
                .find(|d| d.as_str() == name)
                .ok_or_else(|| PlatformError::not_found(ObjectKind::Datastore.to_string(), name))?,
            None => inventory.datastores.first().ok_or_else(|| {
                PlatformError::not_found(ObjectKind::Datastore.to_string(), "default")
            })?,
        };
        Ok(ManagedObjectRef::new(
            ObjectKind::Datastore,
            format!("{}/{}", datacenter.name, datastore),
        ))
    }

    async fn retrieve_summary(&self, vm: &ManagedObjectRef) -> PlatformResult<VmSummary> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let name = state
            .inventory
            .vms
            .get(&vm.id)
            .map(|found| found.name.clone())
            .unwrap_or_else(|| vm.id.clone());
        state.runtime.record(PlatformCall::RetrieveSummary(name.clone()));
        state.runtime.take_fault(FaultPoint::RetrieveSummary)?;

        let found = state.inventory.vm(&vm.id)?.clone();
        // A stopped guest reports nothing, scripted or not
        let guest_ip = if found.power_state != PowerState::PoweredOn {
            None
        } else {
            match state.runtime.scripted_ip(&name) {
                Some(scripted) => scripted,
                None => self.guest_ip(&found, now),
            }
        };

        Ok(VmSummary {
            name: found.name,
            memory_mb: found.memory_mb,
            num_cpu: found.num_cpu,
            power_state: found.power_state,
            boot_time: found.boot_time,
            guest_ip,
        })
    }

    async fn clone_vm(
        &self,
        template: &ManagedObjectRef,
        spec: &CloneSpec,
    ) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::Clone,
            spec.name.clone(),
            PendingTask::Clone {
                template_id: template.id.clone(),
                spec: spec.clone(),
            },
        )
    }

    async fn create_vm(
        &self,
        datacenter: &Datacenter,
        _pool: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::Create,
            spec.name.clone().unwrap_or_default(),
            PendingTask::Create {
                datacenter: datacenter.name.clone(),
                spec: spec.clone(),
            },
        )
    }

    async fn reconfigure_vm(
        &self,
        vm: &ManagedObjectRef,
        spec: &VmConfigSpec,
    ) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::Reconfigure,
            self.vm_name(vm),
            PendingTask::Reconfigure {
                vm_id: vm.id.clone(),
                spec: spec.clone(),
            },
        )
    }

    async fn customize_vm(
        &self,
        vm: &ManagedObjectRef,
        spec: &CustomizationSpec,
    ) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::Customize,
            self.vm_name(vm),
            PendingTask::Customize {
                vm_id: vm.id.clone(),
                spec: spec.clone(),
            },
        )
    }

    async fn power_on(&self, vm: &ManagedObjectRef) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::PowerOn,
            self.vm_name(vm),
            PendingTask::PowerOn {
                vm_id: vm.id.clone(),
            },
        )
    }

    async fn power_off(&self, vm: &ManagedObjectRef) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::PowerOff,
            self.vm_name(vm),
            PendingTask::PowerOff {
                vm_id: vm.id.clone(),
            },
        )
    }

    async fn destroy_vm(&self, vm: &ManagedObjectRef) -> PlatformResult<TaskHandle> {
        self.submit(
            TaskKind::Destroy,
            self.vm_name(vm),
            PendingTask::Destroy {
                vm_id: vm.id.clone(),
            },
        )
    }

    async fn wait_for_task(&self, task: &TaskHandle) -> PlatformResult<TaskResult> {
        let stalled = {
            let mut state = self.state.lock();
            let vm = state
                .runtime
                .tasks
                .get(&task.id)
                .map(|queued| queued.vm_name.clone())
                .ok_or_else(|| PlatformError::not_found("Task", task.id.as_str()))?;
            state.runtime.record(PlatformCall::Wait {
                kind: task.kind,
                vm,
            });
            state.runtime.stalled.contains(&task.kind)
        };

        if stalled {
            debug!(task = %task.kind, task_id = %task.id, "simulated: task stalled");
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        let queued = state
            .runtime
            .tasks
            .remove(&task.id)
            .ok_or_else(|| PlatformError::not_found("Task", task.id.as_str()))?;
        state.runtime.take_fault(FaultPoint::Wait(queued.kind))?;

        let result = self.apply(&mut state.inventory, queued.task)?;
        self.persist(&state.inventory)?;
        debug!(task = %queued.kind, vm = %queued.vm_name, "simulated: task completed");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use vmforge_core::abstractions::MockClock;

    fn platform() -> (SimulatedPlatform, MockClock) {
        let clock = MockClock::new();
        (SimulatedPlatform::new(Arc::new(clock.clone())), clock)
    }

    async fn create(platform: &SimulatedPlatform, name: &str) -> ManagedObjectRef {
        let datacenter = platform.find_datacenter(None).await.unwrap();
        let pool = platform
            .find_resource_pool(&datacenter, None, None)
            .await
            .unwrap();
        let spec = VmConfigSpec {
            name: Some(name.to_string()),
            num_cpus: Some(2),
            memory_mb: Some(2048),
            ..Default::default()
        };
        let handle = platform.create_vm(&datacenter, &pool, &spec).await.unwrap();
        platform.wait_for_task(&handle).await.unwrap().result.unwrap()
    }

    async fn run(platform: &SimulatedPlatform, handle: PlatformResult<TaskHandle>) -> PlatformResult<TaskResult> {
        platform.wait_for_task(&handle?).await
    }

    #[tokio::test]
    async fn test_task_takes_effect_on_wait() {
        let (platform, _clock) = platform();
        let vm = create(&platform, "web").await;

        let handle = platform.power_on(&vm).await.unwrap();
        assert_eq!(
            platform.vm("web").unwrap().power_state,
            PowerState::PoweredOff
        );

        platform.wait_for_task(&handle).await.unwrap();
        assert_eq!(platform.vm("web").unwrap().power_state, PowerState::PoweredOn);
    }

    #[tokio::test]
    async fn test_guest_reports_dhcp_lease_after_delay() {
        let (platform, clock) = platform();
        let vm = create(&platform, "web").await;
        run(&platform, platform.power_on(&vm).await).await.unwrap();

        let summary = platform.retrieve_summary(&vm).await.unwrap();
        assert!(summary.boot_time.is_some());
        assert_eq!(summary.guest_ip, None);

        clock.advance(DEFAULT_LEASE_DELAY);
        let summary = platform.retrieve_summary(&vm).await.unwrap();
        assert_eq!(summary.guest_ip.as_deref(), Some("10.0.0.10"));
    }

    #[tokio::test]
    async fn test_destroy_requires_power_off() {
        let (platform, _clock) = platform();
        let vm = create(&platform, "web").await;
        run(&platform, platform.power_on(&vm).await).await.unwrap();

        let err = run(&platform, platform.destroy_vm(&vm).await)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::TaskFailed { .. }));

        run(&platform, platform.power_off(&vm).await).await.unwrap();
        // A second power-off is benign
        run(&platform, platform.power_off(&vm).await).await.unwrap();
        run(&platform, platform.destroy_vm(&vm).await).await.unwrap();
        assert!(platform.vm("web").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_names_fail_the_task() {
        let (platform, _clock) = platform();
        create(&platform, "web").await;

        let datacenter = platform.find_datacenter(None).await.unwrap();
        let pool = platform
            .find_resource_pool(&datacenter, None, None)
            .await
            .unwrap();
        let spec = VmConfigSpec {
            name: Some("web".to_string()),
            num_cpus: Some(1),
            memory_mb: Some(512),
            ..Default::default()
        };
        let result = run(&platform, platform.create_vm(&datacenter, &pool, &spec).await).await;
        assert!(matches!(result, Err(PlatformError::TaskFailed { .. })));
    }

    #[tokio::test]
    async fn test_injected_fault_fires_once() {
        let (platform, _clock) = platform();
        platform.fail_next(FaultPoint::FindDatacenter, PlatformError::fault("session expired"));

        assert!(platform.find_datacenter(None).await.is_err());
        assert!(platform.find_datacenter(None).await.is_ok());
        assert_eq!(platform.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_lookups_are_not_found() {
        let (platform, _clock) = platform();

        let err = platform.find_datacenter(Some("nowhere")).await.unwrap_err();
        assert!(err.is_not_found());

        let datacenter = platform.find_datacenter(None).await.unwrap();
        assert!(platform
            .find_vm(&datacenter, "missing")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(platform
            .find_resource_pool(&datacenter, Some("no-such-cluster"), None)
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_inventory_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let database = Arc::new(Database::create(temp_dir.path().join("sim.redb")).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new());

        {
            let platform = SimulatedPlatform::persistent(database.clone(), clock.clone()).unwrap();
            let vm = create(&platform, "kept").await;
            run(&platform, platform.power_on(&vm).await).await.unwrap();
        }

        let reopened = SimulatedPlatform::persistent(database, clock).unwrap();
        let vm = reopened.vm("kept").unwrap();
        assert_eq!(vm.power_state, PowerState::PoweredOn);
        assert_eq!(vm.lease, Some(Ipv4Addr::new(10, 0, 0, 10)));
    }
}
