//! Create / read / update / delete over a tracked VM record
//!
//! Each operation runs under the configured operation timeout and keeps the
//! [`TrackedVm`] record in line with what the platform reports: create sets
//! the identity, a read that finds nothing clears it, delete clears it only
//! once teardown has completed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use vmforge_core::{
    abstractions::{CancelToken, Clock},
    config::ControllerConfig,
    error::{VmforgeError, VmforgeResult},
    platform::{HypervisorClient, TaskKind},
    types::{TrackedVm, VirtualMachineSpec},
};

use crate::convergence::{AddressHints, ConvergencePoller};
use crate::lookup::VmLocator;
use crate::mapping::{resize_config, MappingOptions};
use crate::provisioning::ProvisioningEngine;
use crate::reconciler::{ReconcileOutcome, StateReconciler};
use crate::task_runner::TaskRunner;
use crate::teardown::TeardownSequencer;

#[derive(Clone)]
pub struct VirtualMachineResource {
    client: Arc<dyn HypervisorClient>,
    provisioning: ProvisioningEngine,
    reconciler: StateReconciler,
    teardown: TeardownSequencer,
    runner: TaskRunner,
    operation_timeout: Duration,
}

impl VirtualMachineResource {
    pub fn new(
        client: Arc<dyn HypervisorClient>,
        clock: Arc<dyn Clock>,
        config: &ControllerConfig,
    ) -> Self {
        let poller = ConvergencePoller::new(client.clone(), clock, config.convergence.clone());
        Self {
            provisioning: ProvisioningEngine::new(
                client.clone(),
                MappingOptions::from(&config.defaults),
            ),
            reconciler: StateReconciler::new(client.clone(), poller),
            teardown: TeardownSequencer::new(client.clone()),
            runner: TaskRunner::new(client.clone()),
            operation_timeout: config.operation_timeout,
            client,
        }
    }

    /// Provision the VM and read it back
    ///
    /// A VM that disappears before the read-back is a `NotFound` error, so
    /// a successful create always carries an identity.
    #[instrument(skip_all, fields(vm = %spec.name))]
    pub async fn create(
        &self,
        spec: VirtualMachineSpec,
        cancel: &CancelToken,
    ) -> VmforgeResult<TrackedVm> {
        let name = spec.name.clone();
        self.with_deadline("create", &name, async {
            let handle = self.provisioning.provision(&spec, cancel).await?;
            let mut tracked = TrackedVm::created(spec);
            tracked.datacenter = Some(handle.datacenter);
            self.refresh(&mut tracked, cancel).await?;
            if !tracked.is_tracked() {
                return Err(VmforgeError::not_found(format!(
                    "virtual machine '{}' (vanished before it could be read back)",
                    tracked.spec.name
                )));
            }
            info!(id = %tracked.id, "virtual machine created");
            Ok(tracked)
        })
        .await
    }

    /// Refresh `tracked` from the platform; clears the identity if the VM
    /// no longer exists
    #[instrument(skip_all, fields(vm = %tracked.spec.name))]
    pub async fn read(&self, tracked: &mut TrackedVm, cancel: &CancelToken) -> VmforgeResult<()> {
        let name = tracked.spec.name.clone();
        self.with_deadline("read", &name, self.refresh(tracked, cancel))
            .await
    }

    /// Apply a changed spec to an existing VM
    ///
    /// CPU and memory differences are pushed through a reconfigure task;
    /// the record then takes the new spec and is read back.
    #[instrument(skip_all, fields(vm = %tracked.spec.name))]
    pub async fn update(
        &self,
        tracked: &mut TrackedVm,
        desired: VirtualMachineSpec,
        cancel: &CancelToken,
    ) -> VmforgeResult<()> {
        if desired.name != tracked.spec.name {
            return Err(VmforgeError::validation(
                "name",
                format!(
                    "cannot rename '{}' to '{}'; name is immutable once created",
                    tracked.spec.name, desired.name
                ),
            ));
        }
        desired.validate()?;

        let name = desired.name.clone();
        self.with_deadline("update", &name, async {
            let cpu_changed = tracked.cpu.unwrap_or(tracked.spec.vcpu) != desired.vcpu;
            let memory_changed =
                tracked.memory_mb.unwrap_or(tracked.spec.memory_mb) != desired.memory_mb;

            if cpu_changed || memory_changed {
                let datacenter = tracked
                    .datacenter
                    .clone()
                    .or_else(|| desired.datacenter.clone());
                let (_, vm) = VmLocator::new(self.client.clone())
                    .locate(&name, datacenter.as_deref())
                    .await?;
                let resize = resize_config(desired.vcpu, desired.memory_mb);
                debug!(vcpu = desired.vcpu, memory_mb = desired.memory_mb, "resizing");
                self.runner
                    .run(TaskKind::Reconfigure, &name, cancel, self.client.reconfigure_vm(&vm, &resize))
                    .await?;
            }

            tracked.spec = desired;
            self.refresh(tracked, cancel).await
        })
        .await
    }

    /// Tear the VM down; the identity is cleared only on success
    #[instrument(skip_all, fields(vm = %tracked.spec.name))]
    pub async fn delete(&self, tracked: &mut TrackedVm, cancel: &CancelToken) -> VmforgeResult<()> {
        let name = tracked.spec.name.clone();
        let datacenter = tracked
            .datacenter
            .clone()
            .or_else(|| tracked.spec.datacenter.clone());

        self.with_deadline(
            "delete",
            &name,
            self.teardown.destroy(&name, datacenter.as_deref(), cancel),
        )
        .await?;

        tracked.clear_identity();
        info!("virtual machine deleted");
        Ok(())
    }

    async fn refresh(&self, tracked: &mut TrackedVm, cancel: &CancelToken) -> VmforgeResult<()> {
        let datacenter = tracked
            .datacenter
            .clone()
            .or_else(|| tracked.spec.datacenter.clone());
        let hints = AddressHints::from(&tracked.spec);

        match self
            .reconciler
            .reconcile(&tracked.spec.name, datacenter.as_deref(), hints, cancel)
            .await?
        {
            ReconcileOutcome::Found(live) => tracked.apply_snapshot(&live),
            ReconcileOutcome::NotFound => {
                warn!("clearing tracked identity");
                tracked.clear_identity();
            }
        }
        Ok(())
    }

    async fn with_deadline<T, F>(&self, operation: &str, name: &str, fut: F) -> VmforgeResult<T>
    where
        F: Future<Output = VmforgeResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(VmforgeError::Timeout {
                operation: format!("{} of VM '{}'", operation, name),
                duration: self.operation_timeout,
            }),
        }
    }
}
