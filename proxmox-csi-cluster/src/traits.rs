//! The cluster API seam between volume orchestration and its backends.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{StorageContent, VmConfig, VmConfigPatch, VmSummary};

/// Typed surface of the Proxmox REST API the driver relies on.
///
/// The production implementation is [`crate::ProxmoxClient`]; tests use
/// [`crate::MockCluster`]. No business logic lives behind this trait,
/// only request/response plumbing.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List the names of all cluster nodes.
    async fn list_nodes(&self) -> Result<Vec<String>>;

    /// List the VMs currently hosted on a node.
    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>>;

    /// Fetch a VM's configuration.
    async fn get_vm_config(&self, vmid: u32, node: &str) -> Result<VmConfig>;

    /// Apply a configuration patch (attach or detach a SCSI device).
    async fn update_vm_config(&self, vmid: u32, node: &str, patch: &VmConfigPatch) -> Result<()>;

    /// Allocate a disk on a storage. The size is rounded up to whole
    /// GiB before it is sent; the user never gets less than requested.
    async fn create_vm_disk(
        &self,
        vmid: u32,
        node: &str,
        storage: &str,
        filename: &str,
        size_bytes: u64,
    ) -> Result<()>;

    /// Delete a disk from a storage.
    async fn delete_vm_disk(&self, vmid: u32, node: &str, storage: &str, volume: &str)
        -> Result<()>;

    /// Resize an attached disk. `size` is either `+<n>G` (grow by n GiB)
    /// or `<n>M` (absolute size in MiB).
    async fn resize_vm_disk(&self, vmid: u32, node: &str, device: &str, size: &str) -> Result<()>;

    /// List the content entries of a storage.
    async fn list_storage_content(&self, node: &str, storage: &str)
        -> Result<Vec<StorageContent>>;

    /// Find a VM by name, scanning all nodes. Matching is
    /// case-insensitive and exact; the first hit wins. Nodes that fail
    /// to answer are skipped.
    async fn find_vm_by_name(&self, vm_name: &str) -> Result<Option<(u32, String)>> {
        debug!(name = %vm_name, "Searching for VM by name");

        for node in self.list_nodes().await? {
            let vms = match self.list_vms(&node).await {
                Ok(vms) => vms,
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to query VMs on node");
                    continue;
                }
            };

            for vm in vms {
                if let Some(name) = &vm.name {
                    if name.eq_ignore_ascii_case(vm_name) {
                        debug!(vmid = vm.vmid, node = %node, "Found VM by name");
                        return Ok(Some((vm.vmid, node)));
                    }
                }
            }
        }

        warn!(name = %vm_name, "No VM found with name");
        Ok(None)
    }

    /// Find which node currently hosts a VM. VMs live-migrate, so this
    /// must be re-resolved per operation.
    async fn find_vm_node(&self, vmid: u32) -> Result<Option<String>> {
        for node in self.list_nodes().await? {
            let vms = match self.list_vms(&node).await {
                Ok(vms) => vms,
                Err(e) => {
                    warn!(node = %node, error = %e, "Failed to query VMs on node");
                    continue;
                }
            };

            if vms.iter().any(|vm| vm.vmid == vmid) {
                return Ok(Some(node));
            }
        }

        warn!(vmid = vmid, "VM not found on any node");
        Ok(None)
    }
}
