//! # Proxmox CSI Cluster
//!
//! Proxmox cluster access and volume orchestration for the CSI driver.
//!
//! The crate is split along one seam:
//! - [`ClusterApi`] is the typed surface of the Proxmox REST API, with
//!   [`ProxmoxClient`] as the production implementation and
//!   [`MockCluster`] for tests and development.
//! - [`operations`] is pure orchestration on top of that surface:
//!   create, delete, attach, detach, expand, and the cluster-wide
//!   attachment scan that keeps a volume from being writable on two
//!   VMs at once.
//!
//! Authoritative state lives in the cluster's VM configurations; this
//! crate holds none of its own.

pub mod client;
pub mod error;
pub mod mock;
pub mod operations;
pub mod traits;
pub mod types;
pub mod volume_id;
pub mod wwn;

pub use client::ProxmoxClient;
pub use error::{ClusterError, Result};
pub use mock::MockCluster;
pub use operations::{
    attach_volume, check_existing_attachments, create_volume, delete_volume, detach_volume,
    expand_volume, PublishContext,
};
pub use traits::ClusterApi;
pub use types::{StorageContent, VmConfig, VmConfigPatch, VmSummary};
pub use volume_id::{VolumeId, STORAGE_VMID};
pub use wwn::{
    device_path_for_wwn, extract_scsi_disks, find_free_lun, is_disk_attached, wwn_for_lun,
    LUN_MAX, LUN_MIN, MAX_VOLUMES_PER_NODE,
};
