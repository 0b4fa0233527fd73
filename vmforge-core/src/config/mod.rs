//! Controller configuration
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `VMFORGE_*` environment variables. Everything is validated before
//! the controller is constructed.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VmforgeError, VmforgeResult};

pub mod defaults;
pub mod vm;

pub use defaults::*;
pub use vm::{ConvergenceConfig, VmDefaults};

/// Root configuration structure for vmforge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Deadline for one lifecycle invocation
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Default log directive level for the `vmforge` targets
    pub log_level: String,

    /// Tracked-state database location
    pub state_path: PathBuf,

    /// Registered platform backend to drive
    pub backend: String,

    /// Address poll bounds
    pub convergence: ConvergenceConfig,

    /// Values injected for empty spec fields
    pub defaults: VmDefaults,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(DEFAULT_OPERATION_TIMEOUT_SECS),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            backend: DEFAULT_BACKEND.to_string(),
            convergence: ConvergenceConfig::default(),
            defaults: VmDefaults::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> VmforgeResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> VmforgeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: ControllerConfig = toml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> VmforgeResult<()> {
        self.convergence.apply_env()?;
        self.defaults.apply_env()?;

        self.operation_timeout =
            parse_duration_secs_from_env("VMFORGE_OPERATION_TIMEOUT_SECS", self.operation_timeout);

        if let Ok(level) = std::env::var("VMFORGE_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Ok(path) = std::env::var("VMFORGE_STATE_PATH") {
            self.state_path = PathBuf::from(path);
        }

        if let Ok(backend) = std::env::var("VMFORGE_BACKEND") {
            self.backend = backend;
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> VmforgeResult<()> {
        self.convergence.validate()?;
        self.defaults.validate()?;

        if self.operation_timeout.is_zero() {
            return Err(VmforgeError::ConfigError(
                "operation_timeout must be non-zero".to_string(),
            ));
        }

        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(VmforgeError::ConfigError(format!(
                "Invalid log_level '{}'",
                self.log_level
            )));
        }

        if self.backend.is_empty() {
            return Err(VmforgeError::ConfigError(
                "backend must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> VmforgeResult<String> {
        toml::to_string_pretty(self).map_err(|e| VmforgeError::Internal {
            message: format!("Failed to render configuration: {}", e),
        })
    }
}

pub(crate) fn parse_duration_secs_from_env(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
