//! # Proxmox CSI Host
//!
//! Host-side plumbing for the CSI Node service: resolving a WWN to the
//! local block device through sysfs, and wrapping the host utilities
//! that format, mount, resize and inspect filesystems on the worker VM.

pub mod discovery;
pub mod error;
pub mod format;
pub mod mount;
pub mod resize;
pub mod stats;

pub use discovery::{DeviceScanner, DISCOVERY_INTERVAL, DISCOVERY_TIMEOUT, SCSI_DEVICES_PATH};
pub use error::{HostError, Result};
pub use format::{check_filesystem, format_device, FormatOptions, DEFAULT_FS_TYPE};
pub use mount::{
    bind_mount, get_device_from_mount, is_mounted, mount_device, unmount_path,
};
pub use resize::{filesystem_type, resize_filesystem};
pub use stats::{filesystem_stats, FsStats};
