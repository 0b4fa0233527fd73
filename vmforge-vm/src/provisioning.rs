//! Provisioning engine: clone from a template or build from scratch
//!
//! The desired state is validated before anything touches the platform. The clone
//! path places a copy of the template, attaches the disks beyond the first
//! through a reconfigure task and applies guest customization. The create
//! path builds every disk and NIC into the initial configuration. Both end
//! with a power-on so the VM has a boot timestamp for convergence.
//!
//! No cleanup is attempted when a later step fails; the partially built VM
//! stays on the platform for teardown to remove.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use vmforge_core::{
    abstractions::CancelToken,
    error::{VmforgeError, VmforgeResult},
    platform::{Datacenter, HypervisorClient, ManagedObjectRef, PlatformError, TaskKind},
    types::{VirtualMachineSpec, VmHandle},
};

use crate::mapping::{customization_spec, MappingOptions};
use crate::task_runner::TaskRunner;

#[derive(Clone)]
pub struct ProvisioningEngine {
    client: Arc<dyn HypervisorClient>,
    runner: TaskRunner,
    mapping: MappingOptions,
}

impl ProvisioningEngine {
    pub fn new(client: Arc<dyn HypervisorClient>, mapping: MappingOptions) -> Self {
        Self {
            runner: TaskRunner::new(client.clone()),
            client,
            mapping,
        }
    }

    #[instrument(skip_all, fields(vm = %spec.name, clone = spec.is_clone()))]
    pub async fn provision(
        &self,
        spec: &VirtualMachineSpec,
        cancel: &CancelToken,
    ) -> VmforgeResult<VmHandle> {
        spec.validate()?;

        let datacenter = self
            .client
            .find_datacenter(spec.datacenter.as_deref())
            .await
            .map_err(|e| failed("find datacenter", spec, e))?;

        let reference = match spec.template.as_deref() {
            Some(template) => self.clone_from_template(spec, &datacenter, template, cancel).await?,
            None => self.create_from_scratch(spec, &datacenter, cancel).await?,
        };

        self.runner
            .run(TaskKind::PowerOn, &spec.name, cancel, self.client.power_on(&reference))
            .await?;

        info!(datacenter = %datacenter.name, reference = %reference, "virtual machine provisioned");
        Ok(VmHandle {
            name: spec.name.clone(),
            datacenter: datacenter.name,
            reference,
        })
    }

    async fn clone_from_template(
        &self,
        spec: &VirtualMachineSpec,
        datacenter: &Datacenter,
        template: &str,
        cancel: &CancelToken,
    ) -> VmforgeResult<ManagedObjectRef> {
        let source = self
            .client
            .find_template(datacenter, template)
            .await
            .map_err(|e| failed("find template", spec, e))?;
        let pool = self.resource_pool(spec, datacenter).await?;
        let datastore = match spec.datastore.as_deref() {
            Some(name) => Some(
                self.client
                    .find_datastore(datacenter, Some(name))
                    .await
                    .map_err(|e| failed("find datastore", spec, e))?,
            ),
            None => None,
        };

        debug!(template = %source, pool = %pool, "cloning from template");
        let clone = self.mapping.clone_spec(spec, &pool, datastore.as_ref());
        let result = self
            .runner
            .run(TaskKind::Clone, &spec.name, cancel, self.client.clone_vm(&source, &clone))
            .await?;
        let vm = self.produced_vm(spec, datacenter, result.result).await?;

        if let Some(extra) = self.mapping.additional_disks_config(spec, datastore.as_ref()) {
            debug!(disks = extra.device_changes.len(), "attaching additional disks");
            self.runner
                .run(TaskKind::Reconfigure, &spec.name, cancel, self.client.reconfigure_vm(&vm, &extra))
                .await?;
        }

        let customization = customization_spec(spec);
        self.runner
            .run(
                TaskKind::Customize,
                &spec.name,
                cancel,
                self.client.customize_vm(&vm, &customization),
            )
            .await?;

        Ok(vm)
    }

    async fn create_from_scratch(
        &self,
        spec: &VirtualMachineSpec,
        datacenter: &Datacenter,
        cancel: &CancelToken,
    ) -> VmforgeResult<ManagedObjectRef> {
        let pool = self.resource_pool(spec, datacenter).await?;
        let datastore = self
            .client
            .find_datastore(datacenter, spec.datastore.as_deref())
            .await
            .map_err(|e| failed("find datastore", spec, e))?;

        debug!(pool = %pool, datastore = %datastore, "creating from scratch");
        let config = self.mapping.create_config(spec, &datastore);
        let result = self
            .runner
            .run(
                TaskKind::Create,
                &spec.name,
                cancel,
                self.client.create_vm(datacenter, &pool, &config),
            )
            .await?;

        self.produced_vm(spec, datacenter, result.result).await
    }

    async fn resource_pool(
        &self,
        spec: &VirtualMachineSpec,
        datacenter: &Datacenter,
    ) -> VmforgeResult<ManagedObjectRef> {
        self.client
            .find_resource_pool(
                datacenter,
                spec.cluster.as_deref(),
                spec.resource_pool.as_deref(),
            )
            .await
            .map_err(|e| failed("find resource pool", spec, e))
    }

    /// The task result names the new VM; fall back to a lookup by name
    async fn produced_vm(
        &self,
        spec: &VirtualMachineSpec,
        datacenter: &Datacenter,
        produced: Option<ManagedObjectRef>,
    ) -> VmforgeResult<ManagedObjectRef> {
        match produced {
            Some(vm) => Ok(vm),
            None => self
                .client
                .find_vm(datacenter, &spec.name)
                .await
                .map_err(|e| failed("find vm", spec, e)),
        }
    }
}

fn failed(operation: &str, spec: &VirtualMachineSpec, source: PlatformError) -> VmforgeError {
    VmforgeError::Provisioning {
        operation: operation.to_string(),
        vm_name: spec.name.clone(),
        source,
    }
}
