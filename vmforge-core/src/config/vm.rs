//! Guest defaults and convergence tuning

use super::defaults::*;
use super::parse_duration_secs_from_env;
use crate::error::{VmforgeError, VmforgeResult};
use crate::types::AdapterType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounds for the post-boot address poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Sleep between two summary retrievals
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Upper bound on summary retrievals before giving up
    pub max_poll_attempts: u32,

    /// Consecutive retrieval errors tolerated before failing the poll
    pub max_consecutive_errors: u32,
}

/// Values substituted for settings the user left empty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub domain: String,
    pub time_zone: String,
    pub dns_suffixes: Vec<String>,
    pub dns_servers: Vec<String>,
    pub adapter_type: AdapterType,
    /// Provision new disks thin
    pub thin_provisioned: bool,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            time_zone: DEFAULT_TIME_ZONE.to_string(),
            dns_suffixes: DEFAULT_DNS_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            dns_servers: DEFAULT_DNS_SERVERS.iter().map(|s| s.to_string()).collect(),
            adapter_type: AdapterType::E1000,
            thin_provisioned: true,
        }
    }
}

impl ConvergenceConfig {
    /// Overlay convergence settings from environment variables
    pub fn apply_env(&mut self) -> VmforgeResult<()> {
        self.poll_interval =
            parse_duration_secs_from_env("VMFORGE_POLL_INTERVAL_SECS", self.poll_interval);

        if let Ok(val) = std::env::var("VMFORGE_MAX_POLL_ATTEMPTS") {
            self.max_poll_attempts = val.parse().map_err(|_| {
                VmforgeError::ConfigError("Invalid VMFORGE_MAX_POLL_ATTEMPTS".to_string())
            })?;
        }

        if let Ok(val) = std::env::var("VMFORGE_MAX_CONSECUTIVE_ERRORS") {
            self.max_consecutive_errors = val.parse().map_err(|_| {
                VmforgeError::ConfigError("Invalid VMFORGE_MAX_CONSECUTIVE_ERRORS".to_string())
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> VmforgeResult<()> {
        if self.max_poll_attempts == 0 {
            return Err(VmforgeError::ConfigError(
                "convergence.max_poll_attempts must be at least 1".to_string(),
            ));
        }

        if self.max_consecutive_errors == 0 {
            return Err(VmforgeError::ConfigError(
                "convergence.max_consecutive_errors must be at least 1".to_string(),
            ));
        }

        if self.poll_interval > Duration::from_secs(300) {
            return Err(VmforgeError::ConfigError(
                "convergence.poll_interval too large (max 5m)".to_string(),
            ));
        }

        Ok(())
    }
}

impl VmDefaults {
    /// Overlay guest defaults from environment variables
    ///
    /// List values are comma separated.
    pub fn apply_env(&mut self) -> VmforgeResult<()> {
        if let Ok(val) = std::env::var("VMFORGE_DEFAULT_DOMAIN") {
            self.domain = val;
        }

        if let Ok(val) = std::env::var("VMFORGE_DEFAULT_TIME_ZONE") {
            self.time_zone = val;
        }

        if let Ok(val) = std::env::var("VMFORGE_DEFAULT_DNS_SUFFIXES") {
            self.dns_suffixes = split_list(&val);
        }

        if let Ok(val) = std::env::var("VMFORGE_DEFAULT_DNS_SERVERS") {
            self.dns_servers = split_list(&val);
        }

        if let Ok(val) = std::env::var("VMFORGE_DEFAULT_ADAPTER_TYPE") {
            self.adapter_type = val.parse().map_err(|_| {
                VmforgeError::ConfigError("Invalid VMFORGE_DEFAULT_ADAPTER_TYPE".to_string())
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> VmforgeResult<()> {
        if self.domain.is_empty() {
            return Err(VmforgeError::ConfigError(
                "defaults.domain must not be empty".to_string(),
            ));
        }

        if self.time_zone.is_empty() {
            return Err(VmforgeError::ConfigError(
                "defaults.time_zone must not be empty".to_string(),
            ));
        }

        if self.dns_servers.is_empty() {
            return Err(VmforgeError::ConfigError(
                "defaults.dns_servers must list at least one resolver".to_string(),
            ));
        }

        Ok(())
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
