//! Default configuration values for vmforge
//!
//! This module centralizes all default values to make them easy to find and modify.

// Convergence defaults
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 600;
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 10;

// Lifecycle defaults
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30 * 60;

// Guest defaults
pub const DEFAULT_DOMAIN: &str = "vsphere.local";
pub const DEFAULT_TIME_ZONE: &str = "Etc/UTC";
pub const DEFAULT_DNS_SUFFIXES: &[&str] = &["vsphere.local"];
pub const DEFAULT_DNS_SERVERS: &[&str] = &["8.8.8.8", "8.8.4.4"];
pub const DEFAULT_ADAPTER_TYPE: &str = "e1000";

// Process defaults
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_STATE_PATH: &str = "./vmforge-state.redb";
pub const DEFAULT_BACKEND: &str = "simulated";
