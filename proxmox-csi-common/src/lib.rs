//! # Proxmox CSI Common
//!
//! Shared utilities for the CSI driver daemons.
//!
//! ## Logging
//!
//! ```rust
//! use proxmox_csi_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(volume_id = "r1/n1/s1/vm-9999-pvc-a", "volume created");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
