use redb::Database;
use std::sync::Arc;
use tracing::{info, warn};

use vmforge_core::{
    abstractions::{CancelToken, Clock, SystemClock},
    config::ControllerConfig,
    error::{VmforgeError, VmforgeResult},
    spec_parser::{SpecParser, VirtualMachineDocument},
    state_store::{RedbStateStore, StateStore},
    types::TrackedVm,
};
use vmforge_vm::{PlatformRegistry, VirtualMachineResource};

/// Entry point that wires configuration, tracked state and a platform
/// backend into one controller
///
/// ```text
/// ┌──────────────────────────────────────────┐
/// │           VmforgeOrchestrator            │
/// │  • document parsing (injected defaults)  │
/// │  • tracked-state store (redb)            │
/// └──────────────────────────────────────────┘
///          │                      │
///          ▼                      ▼
/// ┌──────────────────┐   ┌──────────────────┐
/// │  vmforge-core    │   │   vmforge-vm     │
/// │ • spec model     │   │ • provisioning   │
/// │ • platform seam  │   │ • convergence    │
/// │ • state store    │   │ • teardown       │
/// └──────────────────┘   └──────────────────┘
/// ```
///
/// The state database is shared between the tracked-state store and the
/// platform backend, so one file holds everything a later run needs.
pub struct VmforgeOrchestrator {
    parser: SpecParser,
    store: Arc<dyn StateStore>,
    resource: VirtualMachineResource,
}

impl VmforgeOrchestrator {
    /// Build against the configured backend using the system clock
    pub fn new(config: &ControllerConfig) -> VmforgeResult<Self> {
        let database = open_database(config)?;
        Self::with_components(
            config,
            database,
            Arc::new(SystemClock::new()),
            &PlatformRegistry::default(),
        )
    }

    pub fn with_components(
        config: &ControllerConfig,
        database: Arc<Database>,
        clock: Arc<dyn Clock>,
        registry: &PlatformRegistry,
    ) -> VmforgeResult<Self> {
        info!("Creating vmforge orchestrator with platform backend: {}", config.backend);

        let store: Arc<dyn StateStore> = Arc::new(RedbStateStore::new(database.clone())?);
        let client = registry.create_platform(&config.backend, database, clock.clone())?;

        Ok(Self {
            parser: SpecParser::new(config.defaults.clone()),
            store,
            resource: VirtualMachineResource::new(client, clock, config),
        })
    }

    /// Converge the platform onto a document
    ///
    /// A VM tracked from an earlier run is read back and updated in place.
    /// Anything else, including a tracked VM that vanished behind our back,
    /// is created.
    pub async fn apply(
        &self,
        document: &VirtualMachineDocument,
        cancel: &CancelToken,
    ) -> VmforgeResult<TrackedVm> {
        let spec = self.parser.parse(document)?;

        if let Some(mut tracked) = self.store.load(&spec.name)? {
            if tracked.is_tracked() {
                self.resource.read(&mut tracked, cancel).await?;
                if tracked.is_tracked() {
                    self.resource.update(&mut tracked, spec, cancel).await?;
                    self.store.sync(&tracked)?;
                    return Ok(tracked);
                }
                warn!(vm = %spec.name, "tracked VM no longer exists, recreating");
            }
            self.store.sync(&tracked)?;
        }

        let tracked = self.resource.create(spec, cancel).await?;
        self.store.sync(&tracked)?;
        info!(vm = %tracked.id, "VM applied");
        Ok(tracked)
    }

    /// Refresh a tracked VM from the platform
    pub async fn read(&self, name: &str, cancel: &CancelToken) -> VmforgeResult<TrackedVm> {
        let mut tracked = self.load_tracked(name)?;
        self.resource.read(&mut tracked, cancel).await?;
        self.store.sync(&tracked)?;
        Ok(tracked)
    }

    /// Tear down a tracked VM and forget it
    pub async fn destroy(&self, name: &str, cancel: &CancelToken) -> VmforgeResult<()> {
        let mut tracked = self.load_tracked(name)?;
        self.resource.delete(&mut tracked, cancel).await?;
        self.store.sync(&tracked)?;
        info!(vm = %name, "VM destroyed");
        Ok(())
    }

    pub fn list(&self) -> VmforgeResult<Vec<TrackedVm>> {
        self.store.list()
    }

    fn load_tracked(&self, name: &str) -> VmforgeResult<TrackedVm> {
        self.store
            .load(name)?
            .ok_or_else(|| VmforgeError::not_found(format!("tracked VM '{}'", name)))
    }
}

/// Open (or create) the state database named by the configuration
pub fn open_database(config: &ControllerConfig) -> VmforgeResult<Arc<Database>> {
    if let Some(parent) = config.state_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let database = Database::create(&config.state_path)?;
    Ok(Arc::new(database))
}
