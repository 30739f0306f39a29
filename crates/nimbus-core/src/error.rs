//! Error types for nimbus-core.

use thiserror::Error;

/// Result type alias for nimbus-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur during instance operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown instance id, image or network reference
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or incomplete create request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Storage clone or metadata service failure; nothing was registered
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Hypervisor launch or exit failure
    #[error("hypervisor error: {0}")]
    Process(#[from] nimbus_vm::VmError),

    /// Operation conflicts with the instance's current lifecycle step
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Check if this error indicates a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}
