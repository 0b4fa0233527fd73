//! Submit a platform task, wait for its terminal state, translate failure
//!
//! Every mutating call the controller makes goes through [`TaskRunner::run`]
//! so that error wrapping, logging and cancellation behave identically for
//! clone, create, reconfigure, customize, power-on, power-off and destroy.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use vmforge_core::{
    abstractions::CancelToken,
    error::{VmforgeError, VmforgeResult},
    platform::{HypervisorClient, PlatformResult, TaskHandle, TaskKind, TaskPhase, TaskResult},
};

#[derive(Clone)]
pub struct TaskRunner {
    client: Arc<dyn HypervisorClient>,
}

impl TaskRunner {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self { client }
    }

    /// Drive one task through submit and wait
    ///
    /// `submit` is the platform call that starts the task. Both halves race
    /// against `cancel`; a cancelled wait leaves the platform task running.
    pub async fn run<F>(
        &self,
        kind: TaskKind,
        vm_name: &str,
        cancel: &CancelToken,
        submit: F,
    ) -> VmforgeResult<TaskResult>
    where
        F: Future<Output = PlatformResult<TaskHandle>>,
    {
        debug!(vm = %vm_name, task = %kind, "submitting task");

        let handle = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(kind, TaskPhase::Submit, vm_name)),
            submitted = submit => submitted
                .map_err(|e| VmforgeError::task_failed(kind, TaskPhase::Submit, vm_name, e))?,
        };

        debug!(vm = %vm_name, task = %kind, task_id = %handle.id, "waiting for task");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(kind, TaskPhase::Wait, vm_name)),
            waited = self.client.wait_for_task(&handle) => waited
                .map_err(|e| VmforgeError::task_failed(kind, TaskPhase::Wait, vm_name, e))?,
        };

        info!(vm = %vm_name, task = %kind, task_id = %handle.id, "task completed");
        Ok(result)
    }
}

fn cancelled(kind: TaskKind, phase: TaskPhase, vm_name: &str) -> VmforgeError {
    VmforgeError::Cancelled {
        operation: format!("{} {} for VM '{}'", phase, kind, vm_name),
    }
}
