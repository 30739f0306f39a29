//! Error types for nimbus-vm.

use thiserror::Error;

/// Result type alias for nimbus-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while configuring or launching a hypervisor.
#[derive(Debug, Error)]
pub enum VmError {
    /// The hypervisor process could not be spawned
    #[error("failed to launch hypervisor {binary}: {source}")]
    Launch {
        /// Binary that was executed
        binary: String,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Architecture tag not known to the launcher
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
