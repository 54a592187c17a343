//! Volume operations with split-brain protection.
//!
//! Pure orchestration over [`ClusterApi`]: every function is idempotent
//! and safe to retry; authoritative state lives in the cluster's VM
//! configurations, never in this process.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};
use crate::traits::ClusterApi;
use crate::types::VmConfigPatch;
use crate::volume_id::{VolumeId, STORAGE_VMID};
use crate::wwn::{
    device_path_for_wwn, extract_scsi_disks, find_free_lun, is_disk_attached, wwn_for_lun,
    DEVICE_PREFIX,
};

/// Publish context handed from ControllerPublish to the Node service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContext {
    /// Stable guest device path, `/dev/disk/by-id/wwn-0x<hex>`.
    pub device_path: String,
    /// LUN the disk is attached at.
    pub lun: u8,
}

impl PublishContext {
    fn for_lun(lun: u8) -> Self {
        Self {
            device_path: device_path_for_wwn(&wwn_for_lun(lun)),
            lun,
        }
    }

    /// Render as the string map carried in the CSI response.
    pub fn into_map(self) -> HashMap<String, String> {
        HashMap::from([
            ("DevicePath".to_string(), self.device_path),
            ("lun".to_string(), self.lun.to_string()),
        ])
    }
}

/// Create a disk on the given storage and return its volume ID.
///
/// A duplicate-name rejection is resolved against the storage content:
/// an existing disk of the same provisioned size is treated as a
/// successful earlier attempt (lost-response retry), anything else
/// surfaces as `AlreadyExists`.
pub async fn create_volume(
    api: &dyn ClusterApi,
    region: &str,
    zone: &str,
    storage: &str,
    pvc_name: &str,
    size_bytes: u64,
) -> Result<VolumeId> {
    let volume_id = VolumeId::create(region, zone, storage, pvc_name);

    info!(
        disk = %volume_id.disk,
        zone = %zone,
        storage = %storage,
        size_bytes = size_bytes,
        "Creating volume"
    );

    match api
        .create_vm_disk(STORAGE_VMID, zone, storage, &volume_id.disk, size_bytes)
        .await
    {
        Ok(()) => {}
        Err(ClusterError::AlreadyExists(message)) => {
            let provisioned = size_bytes.div_ceil(1 << 30) << 30;
            let existing = existing_disk_size(api, zone, storage, &volume_id.disk).await;
            match existing {
                Some(size) if size == provisioned => {
                    info!(
                        disk = %volume_id.disk,
                        size_bytes = size,
                        "Disk already exists with the requested size, treating create as idempotent"
                    );
                }
                _ => return Err(ClusterError::AlreadyExists(message)),
            }
        }
        Err(e) => return Err(e),
    }

    info!(volume_id = %volume_id, "Volume created");
    Ok(volume_id)
}

/// Look up a disk's provisioned size in the storage content listing.
async fn existing_disk_size(
    api: &dyn ClusterApi,
    zone: &str,
    storage: &str,
    disk: &str,
) -> Option<u64> {
    let volid = format!("{}:{}", storage, disk);
    match api.list_storage_content(zone, storage).await {
        Ok(content) => content.into_iter().find(|c| c.volid == volid).map(|c| c.size),
        Err(e) => {
            warn!(storage = %storage, error = %e, "Failed to list storage content");
            None
        }
    }
}

/// Delete a volume. A disk that is already gone counts as success.
pub async fn delete_volume(api: &dyn ClusterApi, volume_id: &VolumeId) -> Result<()> {
    info!(volume_id = %volume_id, "Deleting volume");

    match api
        .delete_vm_disk(
            STORAGE_VMID,
            &volume_id.zone,
            &volume_id.storage,
            &volume_id.disk,
        )
        .await
    {
        Ok(()) => {}
        Err(ClusterError::NotFound(_)) => {
            warn!(volume_id = %volume_id, "Volume already gone, treating delete as success");
        }
        Err(e) => return Err(e),
    }

    info!(volume_id = %volume_id, "Volume deleted");
    Ok(())
}

/// Attach a volume to a VM and return the publish context.
///
/// The dangerous path: before allocating a LUN the whole cluster is
/// scanned for an existing attachment of this disk, so the same volume
/// can never end up writable on two VMs at once.
pub async fn attach_volume(
    api: &dyn ClusterApi,
    vmid: u32,
    volume_id: &VolumeId,
) -> Result<PublishContext> {
    info!(volume_id = %volume_id, vmid = vmid, "Attaching volume");

    let vm_node = api
        .find_vm_node(vmid)
        .await?
        .ok_or_else(|| ClusterError::NotFound(format!("VM {} not found on any node", vmid)))?;

    let vm_config = api.get_vm_config(vmid, &vm_node).await?;
    let scsi_disks = extract_scsi_disks(&vm_config);

    // Idempotency: a repeated publish returns the existing attachment.
    if let Some(lun) = is_disk_attached(&scsi_disks, &volume_id.disk) {
        info!(volume_id = %volume_id, vmid = vmid, lun = lun, "Volume already attached");
        return Ok(PublishContext::for_lun(lun));
    }

    // Split-brain guard: refuse if any other workload VM holds the disk.
    if let Some((holder, lun)) = check_existing_attachments(api, &volume_id.disk).await? {
        if holder == vmid {
            return Ok(PublishContext::for_lun(lun));
        }
        return Err(ClusterError::FailedPrecondition(format!(
            "Volume {} already attached to VM {}",
            volume_id, holder
        )));
    }

    let lun = find_free_lun(&scsi_disks).ok_or_else(|| {
        ClusterError::ResourceExhausted(format!("No free LUN available on VM {}", vmid))
    })?;

    let wwn = wwn_for_lun(lun);
    let device = format!("{}{}", DEVICE_PREFIX, lun);
    let spec = format!(
        "{}:{},wwn=0x{},backup=0",
        volume_id.storage, volume_id.disk, wwn
    );

    info!(
        volume_id = %volume_id,
        vmid = vmid,
        node = %vm_node,
        device = %device,
        wwn = %wwn,
        "Attaching disk"
    );

    api.update_vm_config(vmid, &vm_node, &VmConfigPatch::Attach { device, spec })
        .await?;

    Ok(PublishContext::for_lun(lun))
}

/// Scan every workload VM in the cluster for an attachment of `disk`.
///
/// Returns the `(vmid, lun)` of the holder, if any. Individual VMs or
/// nodes that fail to answer are skipped so a transiently unreadable VM
/// does not block the cluster, but a scan that could not query a single
/// node is a hard error: attaching under an unknown prior state is
/// exactly what this guard exists to prevent.
pub async fn check_existing_attachments(
    api: &dyn ClusterApi,
    disk_name: &str,
) -> Result<Option<(u32, u8)>> {
    debug!(disk = %disk_name, "Scanning cluster for existing attachments");

    let nodes = api.list_nodes().await?;
    let mut nodes_queried = 0usize;

    for node in &nodes {
        let vms = match api.list_vms(node).await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(node = %node, error = %e, "Failed to list VMs during attachment scan");
                continue;
            }
        };
        nodes_queried += 1;

        for vm in vms {
            // Disks parked under the storage owner are at rest, not attached.
            if vm.vmid == STORAGE_VMID {
                continue;
            }

            let vm_config = match api.get_vm_config(vm.vmid, node).await {
                Ok(config) => config,
                Err(e) => {
                    warn!(vmid = vm.vmid, node = %node, error = %e, "Failed to read VM config during scan");
                    continue;
                }
            };

            let scsi_disks = extract_scsi_disks(&vm_config);
            if let Some(lun) = is_disk_attached(&scsi_disks, disk_name) {
                warn!(
                    disk = %disk_name,
                    vmid = vm.vmid,
                    lun = lun,
                    node = %node,
                    "Disk is already attached"
                );
                return Ok(Some((vm.vmid, lun)));
            }
        }
    }

    if nodes_queried == 0 {
        return Err(ClusterError::Unavailable(
            "Attachment scan could not query any cluster node".to_string(),
        ));
    }

    debug!(disk = %disk_name, "No existing attachments found");
    Ok(None)
}

/// Detach a volume from a VM. A vanished VM or an unattached disk both
/// count as success.
pub async fn detach_volume(api: &dyn ClusterApi, vmid: u32, volume_id: &VolumeId) -> Result<()> {
    info!(volume_id = %volume_id, vmid = vmid, "Detaching volume");

    let Some(vm_node) = api.find_vm_node(vmid).await? else {
        warn!(vmid = vmid, "VM not found on any node, assuming already deleted");
        return Ok(());
    };

    let vm_config = api.get_vm_config(vmid, &vm_node).await?;
    let scsi_disks = extract_scsi_disks(&vm_config);

    let Some(lun) = is_disk_attached(&scsi_disks, &volume_id.disk) else {
        warn!(volume_id = %volume_id, vmid = vmid, "Volume not attached, nothing to detach");
        return Ok(());
    };

    let device = format!("{}{}", DEVICE_PREFIX, lun);
    info!(vmid = vmid, node = %vm_node, device = %device, "Detaching disk");

    api.update_vm_config(vmid, &vm_node, &VmConfigPatch::Detach { device })
        .await?;

    info!(volume_id = %volume_id, vmid = vmid, "Volume detached");
    Ok(())
}

/// Grow an attached volume to `new_size_bytes` at the storage level.
/// The filesystem grow happens later on the node.
pub async fn expand_volume(
    api: &dyn ClusterApi,
    vmid: u32,
    volume_id: &VolumeId,
    new_size_bytes: u64,
) -> Result<()> {
    info!(volume_id = %volume_id, new_size_bytes = new_size_bytes, "Expanding volume");

    let vm_node = api
        .find_vm_node(vmid)
        .await?
        .ok_or_else(|| ClusterError::NotFound(format!("VM {} not found on any node", vmid)))?;

    let vm_config = api.get_vm_config(vmid, &vm_node).await?;
    let scsi_disks = extract_scsi_disks(&vm_config);

    let lun = is_disk_attached(&scsi_disks, &volume_id.disk).ok_or_else(|| {
        ClusterError::FailedPrecondition(format!(
            "Volume {} not attached to VM {}, cannot resize",
            volume_id, vmid
        ))
    })?;

    let device = format!("{}{}", DEVICE_PREFIX, lun);
    let size_mib = new_size_bytes / (1 << 20);

    info!(device = %device, size_mib = size_mib, node = %vm_node, "Resizing disk");

    api.resize_vm_disk(vmid, &vm_node, &device, &format!("{}M", size_mib))
        .await?;

    info!(volume_id = %volume_id, "Volume expanded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    const GIB: u64 = 1 << 30;

    fn cluster_with_worker() -> (MockCluster, VolumeId) {
        let cluster = MockCluster::new();
        cluster.add_node("n1");
        cluster.add_vm(100, "worker-1", "n1");
        cluster.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB);
        let volume_id = VolumeId::create("r1", "n1", "s1", "pvc-abc");
        (cluster, volume_id)
    }

    #[tokio::test]
    async fn test_create_volume_returns_encoded_id() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");

        let id = create_volume(&cluster, "r1", "n1", "s1", "pvc-abc", 5 * GIB)
            .await
            .unwrap();
        assert_eq!(id.to_string(), "r1/n1/s1/vm-9999-pvc-abc");
        assert_eq!(cluster.disk_size("s1", "vm-9999-pvc-abc"), Some(5 * GIB));
    }

    #[tokio::test]
    async fn test_create_volume_rounds_size_up() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");

        create_volume(&cluster, "r1", "n1", "s1", "pvc-abc", 5 * GIB + 1)
            .await
            .unwrap();
        assert_eq!(cluster.disk_size("s1", "vm-9999-pvc-abc"), Some(6 * GIB));
    }

    #[tokio::test]
    async fn test_create_volume_duplicate_same_size_is_idempotent() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");
        cluster.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB);

        let id = create_volume(&cluster, "r1", "n1", "s1", "pvc-abc", 5 * GIB)
            .await
            .unwrap();
        assert_eq!(id.disk, "vm-9999-pvc-abc");
    }

    #[tokio::test]
    async fn test_create_volume_duplicate_size_mismatch_fails() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");
        cluster.add_disk("s1", "vm-9999-pvc-abc", 5 * GIB);

        let err = create_volume(&cluster, "r1", "n1", "s1", "pvc-abc", 8 * GIB)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_volume_is_idempotent() {
        let (cluster, volume_id) = cluster_with_worker();

        delete_volume(&cluster, &volume_id).await.unwrap();
        assert_eq!(cluster.disk_size("s1", "vm-9999-pvc-abc"), None);
        // A second delete finds nothing and still succeeds.
        delete_volume(&cluster, &volume_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_attach_assigns_first_free_lun() {
        let (cluster, volume_id) = cluster_with_worker();

        let ctx = attach_volume(&cluster, 100, &volume_id).await.unwrap();
        assert_eq!(ctx.lun, 1);
        assert_eq!(
            ctx.device_path,
            "/dev/disk/by-id/wwn-0x5043432d49443031"
        );

        let map = ctx.into_map();
        assert_eq!(map["lun"], "1");
        assert_eq!(map["DevicePath"], "/dev/disk/by-id/wwn-0x5043432d49443031");
    }

    #[tokio::test]
    async fn test_attach_is_idempotent() {
        let (cluster, volume_id) = cluster_with_worker();

        let first = attach_volume(&cluster, 100, &volume_id).await.unwrap();
        let second = attach_volume(&cluster, 100, &volume_id).await.unwrap();

        assert_eq!(first, second);
        // Exactly one config mutation across both attaches.
        assert_eq!(cluster.update_log().len(), 1);
    }

    #[tokio::test]
    async fn test_attach_refuses_split_brain() {
        let (cluster, volume_id) = cluster_with_worker();
        cluster.add_node("n2");
        cluster.add_vm(200, "worker-2", "n2");
        cluster.set_vm_config_entry(
            200,
            "scsi3",
            "s1:vm-9999-pvc-abc,wwn=0x5043432d49443033,backup=0",
        );

        let err = attach_volume(&cluster, 100, &volume_id).await.unwrap_err();
        match err {
            ClusterError::FailedPrecondition(message) => {
                assert!(message.contains("200"), "message must name the holder VM");
            }
            other => panic!("expected FailedPrecondition, got {:?}", other),
        }
        assert!(cluster.update_log().is_empty());
    }

    #[tokio::test]
    async fn test_attach_ignores_storage_owner_attachments() {
        let (cluster, volume_id) = cluster_with_worker();
        // The disk's at-rest owner is not a workload attachment.
        cluster.add_vm(STORAGE_VMID, "volume-store", "n1");
        cluster.set_vm_config_entry(
            STORAGE_VMID,
            "scsi9",
            "s1:vm-9999-pvc-abc,wwn=0x5043432d49443039,backup=0",
        );

        let ctx = attach_volume(&cluster, 100, &volume_id).await.unwrap();
        assert_eq!(ctx.lun, 1);
    }

    #[tokio::test]
    async fn test_attach_with_no_free_lun() {
        let (cluster, volume_id) = cluster_with_worker();
        for lun in 1..=29u8 {
            cluster.set_vm_config_entry(
                100,
                &format!("scsi{}", lun),
                &format!("s1:vm-9999-pvc-{},backup=0", lun),
            );
        }

        let err = attach_volume(&cluster, 100, &volume_id).await.unwrap_err();
        assert!(matches!(err, ClusterError::ResourceExhausted(_)));
    }

    #[tokio::test]
    async fn test_attach_unknown_vm() {
        let (cluster, volume_id) = cluster_with_worker();

        let err = attach_volume(&cluster, 555, &volume_id).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_scan_degrades_on_partial_failure() {
        let (cluster, volume_id) = cluster_with_worker();
        cluster.add_node("n2");
        cluster.fail_node("n2");

        // n2 is unreadable but n1 answered, so the scan is usable.
        let holder = check_existing_attachments(&cluster, &volume_id.disk)
            .await
            .unwrap();
        assert_eq!(holder, None);
    }

    #[tokio::test]
    async fn test_scan_fails_hard_when_no_node_answers() {
        let (cluster, volume_id) = cluster_with_worker();
        cluster.fail_node("n1");

        let err = check_existing_attachments(&cluster, &volume_id.disk)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (cluster, volume_id) = cluster_with_worker();

        attach_volume(&cluster, 100, &volume_id).await.unwrap();
        detach_volume(&cluster, 100, &volume_id).await.unwrap();

        let config = cluster.get_vm_config(100, "n1").await.unwrap();
        assert!(!config.contains_key("scsi1"));

        // Detaching an unattached volume is a no-op success.
        detach_volume(&cluster, 100, &volume_id).await.unwrap();
        assert_eq!(cluster.update_log().len(), 2);
    }

    #[tokio::test]
    async fn test_detach_from_vanished_vm_succeeds() {
        let (cluster, volume_id) = cluster_with_worker();

        detach_volume(&cluster, 777, &volume_id).await.unwrap();
        assert!(cluster.update_log().is_empty());
    }

    #[tokio::test]
    async fn test_expand_resizes_attached_disk() {
        let (cluster, volume_id) = cluster_with_worker();
        attach_volume(&cluster, 100, &volume_id).await.unwrap();

        expand_volume(&cluster, 100, &volume_id, 20 * GIB)
            .await
            .unwrap();

        assert_eq!(
            cluster.resize_log(),
            vec![(100, "scsi1".to_string(), "20480M".to_string())]
        );
    }

    #[tokio::test]
    async fn test_expand_requires_attachment() {
        let (cluster, volume_id) = cluster_with_worker();

        let err = expand_volume(&cluster, 100, &volume_id, 20 * GIB)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::FailedPrecondition(_)));
    }
}
