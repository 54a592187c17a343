//! Mock cluster backend for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{ClusterError, Result};
use crate::traits::ClusterApi;
use crate::types::{StorageContent, VmConfig, VmConfigPatch, VmSummary};

/// In-memory cluster implementing [`ClusterApi`].
///
/// Simulates nodes, VMs and storage content without a Proxmox API.
/// Every mutating call is recorded so tests can assert idempotency
/// (e.g. "exactly one config update across two publishes").
pub struct MockCluster {
    state: RwLock<State>,
}

#[derive(Default)]
struct State {
    nodes: Vec<String>,
    vms: Vec<MockVm>,
    /// (storage, disk) -> provisioned bytes
    disks: HashMap<(String, String), u64>,
    /// Nodes whose VM listing fails, to exercise scan degradation.
    failing_nodes: HashSet<String>,
    update_log: Vec<(u32, VmConfigPatch)>,
    resize_log: Vec<(u32, String, String)>,
}

struct MockVm {
    vmid: u32,
    name: String,
    node: String,
    config: BTreeMap<String, String>,
}

impl MockCluster {
    /// Create an empty mock cluster.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| ClusterError::Internal("Lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| ClusterError::Internal("Lock poisoned".to_string()))
    }

    /// Register a cluster node.
    pub fn add_node(&self, node: &str) {
        self.write().unwrap().nodes.push(node.to_string());
    }

    /// Register a VM on a node.
    pub fn add_vm(&self, vmid: u32, name: &str, node: &str) {
        self.write().unwrap().vms.push(MockVm {
            vmid,
            name: name.to_string(),
            node: node.to_string(),
            config: BTreeMap::new(),
        });
    }

    /// Set a raw config entry on a VM, e.g. a pre-existing attachment.
    pub fn set_vm_config_entry(&self, vmid: u32, key: &str, value: &str) {
        let mut state = self.write().unwrap();
        let vm = state
            .vms
            .iter_mut()
            .find(|vm| vm.vmid == vmid)
            .expect("unknown mock VM");
        vm.config.insert(key.to_string(), value.to_string());
    }

    /// Pre-populate a disk on a storage.
    pub fn add_disk(&self, storage: &str, disk: &str, size_bytes: u64) {
        self.write()
            .unwrap()
            .disks
            .insert((storage.to_string(), disk.to_string()), size_bytes);
    }

    /// Make a node's VM listing fail.
    pub fn fail_node(&self, node: &str) {
        self.write().unwrap().failing_nodes.insert(node.to_string());
    }

    /// Mutating config calls observed so far.
    pub fn update_log(&self) -> Vec<(u32, VmConfigPatch)> {
        self.read().unwrap().update_log.clone()
    }

    /// Resize calls observed so far, as `(vmid, device, size)`.
    pub fn resize_log(&self) -> Vec<(u32, String, String)> {
        self.read().unwrap().resize_log.clone()
    }

    /// Provisioned size of a disk, if present.
    pub fn disk_size(&self, storage: &str, disk: &str) -> Option<u64> {
        self.read()
            .unwrap()
            .disks
            .get(&(storage.to_string(), disk.to_string()))
            .copied()
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn list_nodes(&self) -> Result<Vec<String>> {
        Ok(self.read()?.nodes.clone())
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        let state = self.read()?;
        if state.failing_nodes.contains(node) {
            return Err(ClusterError::Unavailable(format!(
                "node {} unreachable",
                node
            )));
        }
        Ok(state
            .vms
            .iter()
            .filter(|vm| vm.node == node)
            .map(|vm| VmSummary {
                vmid: vm.vmid,
                name: Some(vm.name.clone()),
            })
            .collect())
    }

    async fn get_vm_config(&self, vmid: u32, node: &str) -> Result<VmConfig> {
        let state = self.read()?;
        let vm = state
            .vms
            .iter()
            .find(|vm| vm.vmid == vmid && vm.node == node)
            .ok_or_else(|| ClusterError::NotFound(format!("VM {} on node {}", vmid, node)))?;

        let mut config = VmConfig::new();
        config.insert(
            "name".to_string(),
            serde_json::Value::String(vm.name.clone()),
        );
        for (key, value) in &vm.config {
            config.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        Ok(config)
    }

    async fn update_vm_config(&self, vmid: u32, node: &str, patch: &VmConfigPatch) -> Result<()> {
        let mut state = self.write()?;
        let vm = state
            .vms
            .iter_mut()
            .find(|vm| vm.vmid == vmid && vm.node == node)
            .ok_or_else(|| ClusterError::NotFound(format!("VM {} on node {}", vmid, node)))?;

        match patch {
            VmConfigPatch::Attach { device, spec } => {
                if vm.config.contains_key(device) {
                    return Err(ClusterError::Api {
                        status: 400,
                        message: format!("device {} already configured", device),
                    });
                }
                vm.config.insert(device.clone(), spec.clone());
            }
            VmConfigPatch::Detach { device } => {
                vm.config.remove(device);
            }
        }

        state.update_log.push((vmid, patch.clone()));
        Ok(())
    }

    async fn create_vm_disk(
        &self,
        _vmid: u32,
        _node: &str,
        storage: &str,
        filename: &str,
        size_bytes: u64,
    ) -> Result<()> {
        let mut state = self.write()?;
        let key = (storage.to_string(), filename.to_string());
        if state.disks.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(format!(
                "volume '{}:{}' already exists",
                storage, filename
            )));
        }
        // Storage provisions whole GiB, same as the real API.
        let provisioned = size_bytes.div_ceil(1 << 30) << 30;
        state.disks.insert(key, provisioned);
        Ok(())
    }

    async fn delete_vm_disk(
        &self,
        _vmid: u32,
        _node: &str,
        storage: &str,
        volume: &str,
    ) -> Result<()> {
        let mut state = self.write()?;
        state
            .disks
            .remove(&(storage.to_string(), volume.to_string()))
            .ok_or_else(|| ClusterError::NotFound(format!("volume {}:{}", storage, volume)))?;
        Ok(())
    }

    async fn resize_vm_disk(&self, vmid: u32, node: &str, device: &str, size: &str) -> Result<()> {
        let mut state = self.write()?;
        let vm = state
            .vms
            .iter()
            .find(|vm| vm.vmid == vmid && vm.node == node)
            .ok_or_else(|| ClusterError::NotFound(format!("VM {} on node {}", vmid, node)))?;
        if !vm.config.contains_key(device) {
            return Err(ClusterError::NotFound(format!(
                "device {} on VM {}",
                device, vmid
            )));
        }
        state
            .resize_log
            .push((vmid, device.to_string(), size.to_string()));
        Ok(())
    }

    async fn list_storage_content(
        &self,
        _node: &str,
        storage: &str,
    ) -> Result<Vec<StorageContent>> {
        let state = self.read()?;
        Ok(state
            .disks
            .iter()
            .filter(|((s, _), _)| s == storage)
            .map(|((s, disk), size)| StorageContent {
                volid: format!("{}:{}", s, disk),
                size: *size,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_vm_by_name_is_case_insensitive() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");
        cluster.add_vm(100, "Worker-1", "n1");

        let found = cluster.find_vm_by_name("worker-1").await.unwrap();
        assert_eq!(found, Some((100, "n1".to_string())));

        let missing = cluster.find_vm_by_name("worker-2").await.unwrap();
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_find_vm_node_skips_failing_nodes() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");
        cluster.add_node("n2");
        cluster.add_vm(100, "worker-1", "n2");
        cluster.fail_node("n1");

        let node = cluster.find_vm_node(100).await.unwrap();
        assert_eq!(node, Some("n2".to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_disk_create_is_rejected() {
        let cluster = MockCluster::new();
        cluster
            .create_vm_disk(9999, "n1", "s1", "vm-9999-pvc-a", 1 << 30)
            .await
            .unwrap();

        let err = cluster
            .create_vm_disk(9999, "n1", "s1", "vm-9999-pvc-a", 1 << 30)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_attach_patch_updates_config() {
        let cluster = MockCluster::new();
        cluster.add_node("n1");
        cluster.add_vm(100, "worker-1", "n1");

        cluster
            .update_vm_config(
                100,
                "n1",
                &VmConfigPatch::Attach {
                    device: "scsi1".to_string(),
                    spec: "s1:vm-9999-pvc-a,wwn=0x5043432d49443031,backup=0".to_string(),
                },
            )
            .await
            .unwrap();

        let config = cluster.get_vm_config(100, "n1").await.unwrap();
        assert!(config.contains_key("scsi1"));
        assert_eq!(cluster.update_log().len(), 1);
    }
}
