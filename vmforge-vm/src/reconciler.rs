//! Read path: snapshot platform truth for one VM

use std::sync::Arc;
use tracing::{info, instrument, warn};

use vmforge_core::{
    abstractions::CancelToken,
    error::VmforgeResult,
    platform::HypervisorClient,
    types::LiveVirtualMachine,
};

use crate::convergence::{AddressHints, ConvergencePoller};
use crate::lookup::VmLocator;

/// Result of a reconcile: either a live snapshot, or the VM is gone
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Found(LiveVirtualMachine),
    NotFound,
}

impl ReconcileOutcome {
    pub fn into_live(self) -> Option<LiveVirtualMachine> {
        match self {
            ReconcileOutcome::Found(live) => Some(live),
            ReconcileOutcome::NotFound => None,
        }
    }
}

#[derive(Clone)]
pub struct StateReconciler {
    locator: VmLocator,
    poller: ConvergencePoller,
}

impl StateReconciler {
    pub fn new(client: Arc<dyn HypervisorClient>, poller: ConvergencePoller) -> Self {
        Self {
            locator: VmLocator::new(client),
            poller,
        }
    }

    /// Resolve `name` inside the hinted (or default) datacenter and build a
    /// snapshot of its sizing and effective address.
    ///
    /// A datacenter or VM that cannot be found yields
    /// [`ReconcileOutcome::NotFound`] rather than an error. A VM that is not
    /// powered on is found without an address.
    #[instrument(skip_all, fields(vm = %name))]
    pub async fn reconcile(
        &self,
        name: &str,
        datacenter: Option<&str>,
        hints: AddressHints,
        cancel: &CancelToken,
    ) -> VmforgeResult<ReconcileOutcome> {
        let (datacenter, vm) = match self.locator.locate(name, datacenter).await {
            Ok(found) => found,
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "virtual machine not found, treating as deleted");
                return Ok(ReconcileOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        let summary = match self.poller.observe(name, &vm, cancel).await {
            Ok(summary) => summary,
            Err(e) if e.is_not_found() => {
                warn!(error = %e, "virtual machine vanished during read");
                return Ok(ReconcileOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        let ip_address = match self
            .poller
            .resolve_with_summary(name, &vm, hints, &summary, cancel)
            .await
        {
            Ok(ip) => ip,
            Err(e) if e.is_not_found() => {
                warn!("virtual machine vanished while polling guest address");
                return Ok(ReconcileOutcome::NotFound);
            }
            Err(e) => return Err(e),
        };

        let live = LiveVirtualMachine {
            name: name.to_string(),
            datacenter: datacenter.name,
            memory_mb: summary.memory_mb,
            vcpu: summary.num_cpu,
            boot_time: summary.boot_time,
            power_state: summary.power_state,
            ip_address,
        };
        info!(
            memory_mb = live.memory_mb,
            vcpu = live.vcpu,
            power_state = ?live.power_state,
            ip = live.ip_address.as_deref().unwrap_or("-"),
            "reconciled virtual machine"
        );
        Ok(ReconcileOutcome::Found(live))
    }
}
