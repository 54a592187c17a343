//! Error types for Proxmox cluster operations.

use thiserror::Error;

/// Errors that can occur while talking to a Proxmox cluster or
/// orchestrating volume state on it.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Malformed caller input (volume id, node id, size).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced object (VM, node, disk) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A disk with the same name already exists on the storage.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The cluster is in a state that forbids the operation,
    /// e.g. the disk is attached to a different VM.
    #[error("Precondition failed: {0}")]
    FailedPrecondition(String),

    /// No free LUN left on the target VM.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The Proxmox API could not be reached at the transport level.
    #[error("Proxmox API unavailable: {0}")]
    Unavailable(String),

    /// The Proxmox API rejected the request.
    #[error("Proxmox API error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
