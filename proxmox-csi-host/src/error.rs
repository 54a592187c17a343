//! Error types for host-side device and filesystem operations.

use std::time::Duration;

use thiserror::Error;

/// Errors from device discovery and filesystem management on the
/// worker VM.
#[derive(Error, Debug)]
pub enum HostError {
    /// The device did not appear in sysfs before the deadline.
    #[error("Device with WWN {wwn} not found after {timeout:?}")]
    DiscoveryTimeout { wwn: String, timeout: Duration },

    /// A referenced path or device is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The filesystem type is not one the driver manages.
    #[error("Unsupported filesystem type: {0}")]
    UnsupportedFilesystem(String),

    /// A host utility exited with a failure status.
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for host operations.
pub type Result<T> = std::result::Result<T, HostError>;
