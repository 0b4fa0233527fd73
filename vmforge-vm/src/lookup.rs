//! Datacenter and VM resolution shared by the read and delete paths

use std::sync::Arc;
use tracing::debug;

use vmforge_core::{
    error::{VmforgeError, VmforgeResult},
    platform::{Datacenter, HypervisorClient, ManagedObjectRef, PlatformError},
};

/// Resolves a VM by name inside a datacenter scope
///
/// A missing datacenter or VM becomes [`VmforgeError::NotFound`]; any other
/// platform failure is wrapped as [`VmforgeError::Platform`].
#[derive(Clone)]
pub struct VmLocator {
    client: Arc<dyn HypervisorClient>,
}

impl VmLocator {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self { client }
    }

    pub async fn datacenter(&self, vm_name: &str, hint: Option<&str>) -> VmforgeResult<Datacenter> {
        let datacenter = self
            .client
            .find_datacenter(hint)
            .await
            .map_err(|e| lookup_failure("find datacenter", vm_name, e))?;
        debug!(vm = %vm_name, datacenter = %datacenter.name, "resolved datacenter");
        Ok(datacenter)
    }

    pub async fn locate(
        &self,
        vm_name: &str,
        hint: Option<&str>,
    ) -> VmforgeResult<(Datacenter, ManagedObjectRef)> {
        let datacenter = self.datacenter(vm_name, hint).await?;
        let vm = self
            .client
            .find_vm(&datacenter, vm_name)
            .await
            .map_err(|e| lookup_failure("find vm", vm_name, e))?;
        debug!(vm = %vm_name, reference = %vm, "resolved virtual machine");
        Ok((datacenter, vm))
    }
}

fn lookup_failure(operation: &str, vm_name: &str, err: PlatformError) -> VmforgeError {
    match err {
        PlatformError::NotFound { kind, name } => {
            VmforgeError::not_found(format!("{} '{}' (while resolving VM '{}')", kind, name, vm_name))
        }
        other => VmforgeError::platform(operation, vm_name, other),
    }
}
