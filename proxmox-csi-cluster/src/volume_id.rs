//! Volume ID parsing and generation.
//!
//! Volume ID format: `region/zone/storage/disk`.
//! Example: `cluster-1/pve-1/alletra-vg/vm-9999-pvc-abc123`.

use std::fmt;
use std::str::FromStr;

use crate::error::{ClusterError, Result};

/// Reserved VM ID that owns volumes at rest. It never hosts workloads;
/// disks are named under it while not attached to any worker VM.
pub const STORAGE_VMID: u32 = 9999;

const SEPARATOR: char = '/';
const PARTS: usize = 4;

/// The canonical volume handle: `(region, zone, storage, disk)`.
///
/// The textual 4-part form is used only at the RPC boundary; everything
/// internal works on this tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    /// Logical cluster name from the driver configuration.
    pub region: String,
    /// Proxmox node the disk was created on.
    pub zone: String,
    /// Storage ID holding the disk.
    pub storage: String,
    /// Disk name, `vm-9999-<pvc-name>`.
    pub disk: String,
}

impl VolumeId {
    /// Compose a volume ID for a new PVC-backed disk.
    pub fn create(region: &str, zone: &str, storage: &str, pvc_name: &str) -> Self {
        Self::create_for_vmid(region, zone, storage, pvc_name, STORAGE_VMID)
    }

    /// Compose a volume ID with an explicit owner VM ID.
    pub fn create_for_vmid(
        region: &str,
        zone: &str,
        storage: &str,
        pvc_name: &str,
        vmid: u32,
    ) -> Self {
        Self {
            region: region.to_string(),
            zone: zone.to_string(),
            storage: storage.to_string(),
            disk: format!("vm-{}-{}", vmid, pvc_name),
        }
    }

    /// Parse the 4-part textual form. Anything else is rejected.
    pub fn parse(volume_id: &str) -> Result<Self> {
        let parts: Vec<&str> = volume_id.split(SEPARATOR).collect();

        if parts.len() != PARTS || parts.iter().any(|p| p.is_empty()) {
            return Err(ClusterError::InvalidArgument(format!(
                "Invalid volume ID format: {}, expected region/zone/storage/disk",
                volume_id
            )));
        }

        Ok(Self {
            region: parts[0].to_string(),
            zone: parts[1].to_string(),
            storage: parts[2].to_string(),
            disk: parts[3].to_string(),
        })
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.region,
            self.zone,
            self.storage,
            self.disk,
            sep = SEPARATOR
        )
    }
}

impl FromStr for VolumeId {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_display() {
        let id = VolumeId::create("cluster-1", "pve-1", "alletra-vg", "pvc-abc123");
        assert_eq!(id.disk, "vm-9999-pvc-abc123");
        assert_eq!(
            id.to_string(),
            "cluster-1/pve-1/alletra-vg/vm-9999-pvc-abc123"
        );
    }

    #[test]
    fn test_round_trip() {
        let id = VolumeId::create("r1", "n1", "s1", "pvc-xyz");
        let parsed = VolumeId::parse(&id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_rejects_two_part_form() {
        // The legacy /storage/disk shape must not parse.
        assert!(VolumeId::parse("/kubedata/vm-9999-static-test").is_err());
    }

    #[test]
    fn test_rejects_wrong_part_count() {
        assert!(VolumeId::parse("a/b/c").is_err());
        assert!(VolumeId::parse("a/b/c/d/e").is_err());
        assert!(VolumeId::parse("").is_err());
    }

    #[test]
    fn test_rejects_empty_component() {
        assert!(VolumeId::parse("r1//s1/vm-9999-x").is_err());
    }
}
