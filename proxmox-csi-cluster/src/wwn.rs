//! WWN derivation, LUN allocation and attachment probing.
//!
//! Every disk the driver attaches carries a WWN derived from its LUN, so
//! the node side can resolve the guest device path without asking the
//! cluster again.

use std::collections::BTreeMap;

use crate::types::VmConfig;

/// Lowest LUN the driver hands out. LUN 0 is reserved for the boot disk.
pub const LUN_MIN: u8 = 1;
/// Highest LUN the driver hands out. QEMU caps a VM at 30 SCSI devices.
pub const LUN_MAX: u8 = 29;

/// SCSI device key prefix in a VM configuration.
pub const DEVICE_PREFIX: &str = "scsi";

/// How many volumes a worker VM can hold; matches the usable LUN range.
pub const MAX_VOLUMES_PER_NODE: u8 = LUN_MAX;

/// Calculate the WWN identifier for a LUN.
///
/// Format: lowercase hex of the ASCII string `PVC-ID<LL>` with the LUN
/// zero-padded to two digits; LUN 5 becomes `5043432d49443035`.
pub fn wwn_for_lun(lun: u8) -> String {
    hex::encode(format!("PVC-ID{:02}", lun))
}

/// Guest device path for a WWN, as exposed by udev.
pub fn device_path_for_wwn(wwn: &str) -> String {
    format!("/dev/disk/by-id/wwn-0x{}", wwn)
}

/// Extract the SCSI attachment map from a VM configuration: every
/// `scsi<N>` key whose value is a string, in key order.
pub fn extract_scsi_disks(vm_config: &VmConfig) -> BTreeMap<String, String> {
    vm_config
        .iter()
        .filter(|(key, _)| key.starts_with(DEVICE_PREFIX))
        .filter_map(|(key, value)| {
            value
                .as_str()
                .map(|s| (key.clone(), s.to_string()))
        })
        .collect()
}

/// Parse a device key of the form `scsi<N>` into its LUN.
fn parse_device_key(key: &str) -> Option<u8> {
    let digits = key.strip_prefix(DEVICE_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse the disk name out of an attachment descriptor of the form
/// `<storage>:<disk>,<key>=<value>,...`.
fn parse_descriptor_disk(descriptor: &str) -> Option<(&str, &str)> {
    let volume = descriptor.split(',').next()?;
    volume.split_once(':')
}

/// Find the smallest free LUN in `[LUN_MIN, LUN_MAX]`, or `None` when
/// the VM is full.
pub fn find_free_lun(scsi_disks: &BTreeMap<String, String>) -> Option<u8> {
    let used: Vec<u8> = scsi_disks.keys().filter_map(|k| parse_device_key(k)).collect();

    (LUN_MIN..=LUN_MAX).find(|lun| !used.contains(lun))
}

/// Check whether `disk_name` is attached in the given SCSI map and
/// return its LUN. The disk name must match the descriptor's volume
/// part exactly.
pub fn is_disk_attached(scsi_disks: &BTreeMap<String, String>, disk_name: &str) -> Option<u8> {
    for (device, descriptor) in scsi_disks {
        let Some(lun) = parse_device_key(device) else {
            continue;
        };
        if let Some((_storage, disk)) = parse_descriptor_disk(descriptor) {
            if disk == disk_name {
                return Some(lun);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scsi_map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_wwn_for_lun() {
        assert_eq!(wwn_for_lun(5), "5043432d49443035");
        assert_eq!(wwn_for_lun(1), "5043432d49443031");
        assert_eq!(wwn_for_lun(29), "5043432d49443239");
    }

    #[test]
    fn test_wwn_shape_and_bijectivity() {
        let mut seen = std::collections::HashSet::new();
        for lun in LUN_MIN..=LUN_MAX {
            let wwn = wwn_for_lun(lun);
            assert_eq!(wwn.len(), 16);
            assert_eq!(
                wwn,
                hex::encode(format!("PVC-ID{:02}", lun)),
                "WWN must be the hex of PVC-ID<LL>"
            );
            assert!(seen.insert(wwn), "WWN must be unique per LUN");
        }
    }

    #[test]
    fn test_device_path_for_wwn() {
        assert_eq!(
            device_path_for_wwn("5043432d49443031"),
            "/dev/disk/by-id/wwn-0x5043432d49443031"
        );
    }

    #[test]
    fn test_find_free_lun_skips_used() {
        let disks = scsi_map(&[
            ("scsi0", "local:vm-100-disk-0,size=32G"),
            ("scsi1", "s1:vm-9999-pvc-a,wwn=0x5043432d49443031,backup=0"),
            ("scsi3", "s1:vm-9999-pvc-b,wwn=0x5043432d49443033,backup=0"),
        ]);
        assert_eq!(find_free_lun(&disks), Some(2));
    }

    #[test]
    fn test_find_free_lun_returns_minimum() {
        // Smallest free LUN in [1,29] regardless of key ordering.
        let mut disks = BTreeMap::new();
        for lun in 1..=10u8 {
            if lun == 7 {
                continue;
            }
            disks.insert(format!("scsi{}", lun), "s1:d,backup=0".to_string());
        }
        assert_eq!(find_free_lun(&disks), Some(7));
    }

    #[test]
    fn test_find_free_lun_exhausted() {
        let mut disks = BTreeMap::new();
        for lun in 1..=29u8 {
            disks.insert(format!("scsi{}", lun), "s1:d,backup=0".to_string());
        }
        assert_eq!(find_free_lun(&disks), None);
    }

    #[test]
    fn test_find_free_lun_ignores_non_device_keys() {
        let disks = scsi_map(&[("scsihw", "virtio-scsi-pci")]);
        assert_eq!(find_free_lun(&disks), Some(1));
    }

    #[test]
    fn test_is_disk_attached_exact_match() {
        let disks = scsi_map(&[(
            "scsi4",
            "s1:vm-9999-pvc-abc,wwn=0x5043432d49443034,backup=0",
        )]);
        assert_eq!(is_disk_attached(&disks, "vm-9999-pvc-abc"), Some(4));
        // A prefix of an attached disk name must not match.
        assert_eq!(is_disk_attached(&disks, "vm-9999-pvc-ab"), None);
        assert_eq!(is_disk_attached(&disks, "vm-9999-pvc-abcd"), None);
    }

    #[test]
    fn test_is_disk_attached_ignores_malformed_keys() {
        let disks = scsi_map(&[("scsihw", "s1:vm-9999-pvc-abc,backup=0")]);
        assert_eq!(is_disk_attached(&disks, "vm-9999-pvc-abc"), None);
    }

    #[test]
    fn test_extract_scsi_disks_filters_strings() {
        let mut config = VmConfig::new();
        config.insert(
            "scsi1".to_string(),
            serde_json::Value::String("s1:vm-9999-pvc-a,backup=0".to_string()),
        );
        config.insert("cores".to_string(), serde_json::json!(4));
        config.insert(
            "name".to_string(),
            serde_json::Value::String("worker-1".to_string()),
        );

        let disks = extract_scsi_disks(&config);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks["scsi1"], "s1:vm-9999-pvc-a,backup=0");
    }
}
