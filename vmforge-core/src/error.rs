use thiserror::Error;

use crate::platform::{PlatformError, TaskKind, TaskPhase};

#[derive(Error, Debug)]
pub enum VmforgeError {
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Provisioning operation '{operation}' failed for VM '{vm_name}'")]
    Provisioning {
        operation: String,
        vm_name: String,
        #[source]
        source: PlatformError,
    },

    #[error("Teardown operation '{operation}' failed for VM '{vm_name}'")]
    Teardown {
        operation: String,
        vm_name: String,
        #[source]
        source: PlatformError,
    },

    #[error("Platform call '{operation}' failed for VM '{vm_name}'")]
    Platform {
        operation: String,
        vm_name: String,
        #[source]
        source: PlatformError,
    },

    #[error("VM '{vm_name}' reported no guest address after {attempts} attempts")]
    ConvergenceExhausted { vm_name: String, attempts: u32 },

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] redb::Error),

    #[error("Storage transaction error: {0}")]
    StorageTransactionError(String),

    #[error("Storage table error: {0}")]
    StorageTableError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type VmforgeResult<T> = std::result::Result<T, VmforgeError>;

impl VmforgeError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        VmforgeError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        VmforgeError::NotFound {
            resource: resource.into(),
        }
    }

    pub fn platform(
        operation: impl Into<String>,
        vm_name: impl Into<String>,
        source: PlatformError,
    ) -> Self {
        VmforgeError::Platform {
            operation: operation.into(),
            vm_name: vm_name.into(),
            source,
        }
    }

    /// Wrap a failed submit or wait of a platform task.
    ///
    /// Provisioning tasks (clone, create, reconfigure, customize, power-on)
    /// become `Provisioning`, power-off and destroy become `Teardown`.
    pub fn task_failed(
        kind: TaskKind,
        phase: TaskPhase,
        vm_name: impl Into<String>,
        source: PlatformError,
    ) -> Self {
        let operation = format!("{} {}", phase, kind);
        let vm_name = vm_name.into();
        if kind.is_teardown() {
            VmforgeError::Teardown {
                operation,
                vm_name,
                source,
            }
        } else {
            VmforgeError::Provisioning {
                operation,
                vm_name,
                source,
            }
        }
    }

    /// True for lookup failures, whether raised by the controller itself or
    /// reported by the platform underneath a wrapped error.
    pub fn is_not_found(&self) -> bool {
        match self {
            VmforgeError::NotFound { .. } => true,
            VmforgeError::Provisioning { source, .. }
            | VmforgeError::Teardown { source, .. }
            | VmforgeError::Platform { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<redb::TransactionError> for VmforgeError {
    fn from(err: redb::TransactionError) -> Self {
        VmforgeError::StorageTransactionError(err.to_string())
    }
}

impl From<redb::TableError> for VmforgeError {
    fn from(err: redb::TableError) -> Self {
        VmforgeError::StorageTableError(err.to_string())
    }
}

impl From<redb::StorageError> for VmforgeError {
    fn from(err: redb::StorageError) -> Self {
        VmforgeError::StorageError(err.into())
    }
}

impl From<redb::DatabaseError> for VmforgeError {
    fn from(err: redb::DatabaseError) -> Self {
        VmforgeError::StorageError(err.into())
    }
}

impl From<redb::CommitError> for VmforgeError {
    fn from(err: redb::CommitError) -> Self {
        VmforgeError::StorageError(err.into())
    }
}
