//! Power-off then destroy, strictly in that order

use std::sync::Arc;
use tracing::{info, instrument};

use vmforge_core::{
    abstractions::CancelToken,
    error::VmforgeResult,
    platform::{HypervisorClient, TaskKind},
};

use crate::lookup::VmLocator;
use crate::task_runner::TaskRunner;

#[derive(Clone)]
pub struct TeardownSequencer {
    client: Arc<dyn HypervisorClient>,
    locator: VmLocator,
    runner: TaskRunner,
}

impl TeardownSequencer {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self {
            locator: VmLocator::new(client.clone()),
            runner: TaskRunner::new(client.clone()),
            client,
        }
    }

    /// Power off and destroy `name`
    ///
    /// A VM that cannot be found is a hard `NotFound` error. A failure in
    /// the power-off phase means destroy is never submitted.
    #[instrument(skip_all, fields(vm = %name))]
    pub async fn destroy(
        &self,
        name: &str,
        datacenter: Option<&str>,
        cancel: &CancelToken,
    ) -> VmforgeResult<()> {
        let (_, vm) = self.locator.locate(name, datacenter).await?;

        self.runner
            .run(TaskKind::PowerOff, name, cancel, self.client.power_off(&vm))
            .await?;
        self.runner
            .run(TaskKind::Destroy, name, cancel, self.client.destroy_vm(&vm))
            .await?;

        info!("virtual machine destroyed");
        Ok(())
    }
}
