//! # Proxmox CSI Proto
//!
//! Generated Rust code from the CSI protobuf definition.
//!
//! This crate contains the gRPC service definitions and message types for
//! the three CSI services the orchestrator talks to:
//! - Identity (plugin info, capabilities, probe)
//! - Controller (volume lifecycle against the Proxmox API)
//! - Node (staging, publishing and filesystem management on the worker VM)

// Include generated code
pub mod generated {
    pub mod csi {
        pub mod v1 {
            include!("generated/csi.v1.rs");
        }
    }
}

/// CSI v1 message and service types
pub mod csi {
    pub use crate::generated::csi::v1::*;
}

// Re-export service traits and servers at the crate root
pub use generated::csi::v1::controller_server::{Controller, ControllerServer};
pub use generated::csi::v1::identity_server::{Identity, IdentityServer};
pub use generated::csi::v1::node_server::{Node, NodeServer};
pub use generated::csi::v1::*;
