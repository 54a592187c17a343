//! Data types exchanged with the Proxmox API.

use serde::Deserialize;

/// A VM's configuration as returned by the Proxmox API: a flat map of
/// option names to values (`scsi1`, `name`, `cores`, ...).
pub type VmConfig = serde_json::Map<String, serde_json::Value>;

/// Summary of a VM as listed under a cluster node.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSummary {
    /// Numeric VM identifier, unique within the cluster.
    pub vmid: u32,
    /// VM name; Proxmox omits it for unnamed VMs.
    #[serde(default)]
    pub name: Option<String>,
}

/// A content entry of a storage (disk image volume).
#[derive(Debug, Clone, Deserialize)]
pub struct StorageContent {
    /// Volume identifier in `<storage>:<disk>` form.
    pub volid: String,
    /// Provisioned size in bytes.
    #[serde(default)]
    pub size: u64,
}

/// A typed patch against a VM configuration.
///
/// The Proxmox config endpoint either sets a device key to a disk
/// descriptor string or removes a key via the `delete` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmConfigPatch {
    /// Set `device` (e.g. `scsi3`) to the given disk descriptor.
    Attach { device: String, spec: String },
    /// Remove `device` from the configuration.
    Detach { device: String },
}

impl VmConfigPatch {
    /// Render the patch as the request body the config endpoint expects.
    pub fn to_body(&self) -> serde_json::Value {
        match self {
            VmConfigPatch::Attach { device, spec } => {
                let mut body = serde_json::Map::new();
                body.insert(device.clone(), serde_json::Value::String(spec.clone()));
                serde_json::Value::Object(body)
            }
            VmConfigPatch::Detach { device } => {
                serde_json::json!({ "delete": device })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_patch_body() {
        let patch = VmConfigPatch::Attach {
            device: "scsi3".to_string(),
            spec: "lvm:vm-9999-pvc-abc,wwn=0x5043432d49443033,backup=0".to_string(),
        };
        let body = patch.to_body();
        assert_eq!(
            body["scsi3"],
            "lvm:vm-9999-pvc-abc,wwn=0x5043432d49443033,backup=0"
        );
    }

    #[test]
    fn test_detach_patch_body() {
        let patch = VmConfigPatch::Detach {
            device: "scsi5".to_string(),
        };
        assert_eq!(patch.to_body(), serde_json::json!({ "delete": "scsi5" }));
    }
}
