//! Platform backend registry
//!
//! Backends register a factory under a name; the CLI builds whichever one
//! the configuration selects. Only the simulated platform is built in.

use redb::Database;
use std::collections::HashMap;
use std::sync::Arc;

use vmforge_core::{
    abstractions::Clock,
    error::{VmforgeError, VmforgeResult},
    platform::HypervisorClient,
};

use crate::simulated::SimulatedPlatform;

/// Builds a platform client for one backend type
pub trait PlatformFactory: Send + Sync {
    fn create_platform(
        &self,
        database: Arc<Database>,
        clock: Arc<dyn Clock>,
    ) -> VmforgeResult<Arc<dyn HypervisorClient>>;

    fn backend_type(&self) -> &'static str;

    fn description(&self) -> &'static str;
}

#[derive(Clone)]
pub struct PlatformRegistry {
    factories: HashMap<String, Arc<dyn PlatformFactory>>,
}

impl PlatformRegistry {
    /// Empty registry without the built-in backend
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn PlatformFactory>) {
        let backend_type = factory.backend_type().to_string();
        tracing::info!(
            "Registering platform backend: {} ({})",
            backend_type,
            factory.description()
        );
        self.factories.insert(backend_type, factory);
    }

    pub fn create_platform(
        &self,
        backend_type: &str,
        database: Arc<Database>,
        clock: Arc<dyn Clock>,
    ) -> VmforgeResult<Arc<dyn HypervisorClient>> {
        let factory = self.factories.get(backend_type).ok_or_else(|| {
            VmforgeError::ConfigError(format!(
                "Unknown platform backend: '{}'. Available backends: {:?}",
                backend_type,
                self.list_available_backends()
            ))
        })?;

        factory.create_platform(database, clock)
    }

    pub fn list_available_backends(&self) -> Vec<&str> {
        let mut backends: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        backends.sort_unstable();
        backends
    }

    /// `(backend type, description)` for every registered backend
    pub fn backend_info(&self) -> Vec<(String, String)> {
        let mut info: Vec<(String, String)> = self
            .factories
            .values()
            .map(|f| (f.backend_type().to_string(), f.description().to_string()))
            .collect();
        info.sort();
        info
    }
}

impl Default for PlatformRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SimulatedPlatformFactory));
        registry
    }
}

/// Factory for the simulated platform, persisted in the shared database
pub struct SimulatedPlatformFactory;

impl PlatformFactory for SimulatedPlatformFactory {
    fn create_platform(
        &self,
        database: Arc<Database>,
        clock: Arc<dyn Clock>,
    ) -> VmforgeResult<Arc<dyn HypervisorClient>> {
        Ok(Arc::new(SimulatedPlatform::persistent(database, clock)?))
    }

    fn backend_type(&self) -> &'static str {
        "simulated"
    }

    fn description(&self) -> &'static str {
        "In-memory hypervisor with a persisted inventory (no real VMs)"
    }
}
