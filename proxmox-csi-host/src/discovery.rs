//! WWN-based block device discovery via sysfs scanning.
//!
//! After the controller attaches a disk, the guest kernel needs a
//! moment to enumerate it. The scanner polls sysfs on a short interval
//! under a bounded deadline instead of subscribing to udev events.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{HostError, Result};

/// Where the kernel exposes SCSI devices.
pub const SCSI_DEVICES_PATH: &str = "/sys/bus/scsi/devices";

/// Total time to wait for a freshly attached device to appear.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(50);

/// Polling scanner that maps a WWN to a local block device path.
///
/// The sysfs root is injectable so tests can point the scanner at a
/// fixture tree.
pub struct DeviceScanner {
    sysfs_path: PathBuf,
    timeout: Duration,
    interval: Duration,
}

impl DeviceScanner {
    /// Scanner over the real sysfs with default deadline.
    pub fn new() -> Self {
        Self::with_sysfs_path(SCSI_DEVICES_PATH)
    }

    /// Scanner over a custom sysfs root.
    pub fn with_sysfs_path(path: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_path: path.into(),
            timeout: DISCOVERY_TIMEOUT,
            interval: DISCOVERY_INTERVAL,
        }
    }

    /// Override the discovery deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve a WWN (hex string without the `0x` prefix) to a device
    /// path such as `/dev/sda`, polling until the deadline.
    pub async fn discover_by_wwn(&self, wwn: &str) -> Result<String> {
        info!(wwn = %wwn, "Discovering device by WWN");

        let attempts = (self.timeout.as_millis() / self.interval.as_millis()).max(1);

        for _ in 0..attempts {
            if let Some(device) = self.scan_for_wwn(wwn) {
                info!(wwn = %wwn, device = %device, "Device found");
                return Ok(device);
            }
            tokio::time::sleep(self.interval).await;
        }

        Err(HostError::DiscoveryTimeout {
            wwn: wwn.to_string(),
            timeout: self.timeout,
        })
    }

    /// One pass over the sysfs tree.
    fn scan_for_wwn(&self, target_wwn: &str) -> Option<String> {
        let entries = match fs::read_dir(&self.sysfs_path) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %self.sysfs_path.display(), error = %e, "Cannot read sysfs");
                return None;
            }
        };

        for entry in entries.flatten() {
            let device_dir = entry.path();

            if !vendor_is_qemu(&device_dir) {
                continue;
            }

            let Some(wwn) = device_wwn(&device_dir) else {
                continue;
            };
            if wwn != target_wwn {
                continue;
            }

            if let Some(name) = block_device_name(&device_dir) {
                return Some(format!("/dev/{}", name));
            }
        }

        None
    }
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Virtual disks attached by the driver present as QEMU SCSI targets.
fn vendor_is_qemu(device_dir: &Path) -> bool {
    match fs::read_to_string(device_dir.join("vendor")) {
        Ok(vendor) => vendor.trim().eq_ignore_ascii_case("QEMU"),
        Err(_) => false,
    }
}

/// The device's WWN, from its `naa.`-prefixed wwid attribute.
fn device_wwn(device_dir: &Path) -> Option<String> {
    let wwid = fs::read_to_string(device_dir.join("wwid")).ok()?;
    let wwid = wwid.trim();
    wwid.strip_prefix("naa.").map(str::to_string)
}

/// First (lexicographically) block device name under `block/`.
fn block_device_name(device_dir: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(device_dir.join("block"))
        .ok()?
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_device(root: &Path, name: &str, vendor: &str, wwid: &str, block: &str) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("block").join(block)).unwrap();
        fs::write(dir.join("vendor"), vendor).unwrap();
        fs::write(dir.join("wwid"), wwid).unwrap();
    }

    #[tokio::test]
    async fn test_discovers_device_by_wwn() {
        let sysfs = tempfile::tempdir().unwrap();
        fixture_device(
            sysfs.path(),
            "2:0:0:1",
            "QEMU    \n",
            "naa.5043432d49443031\n",
            "sdx",
        );

        let scanner = DeviceScanner::with_sysfs_path(sysfs.path())
            .with_timeout(Duration::from_millis(200));
        let device = scanner.discover_by_wwn("5043432d49443031").await.unwrap();
        assert_eq!(device, "/dev/sdx");
    }

    #[tokio::test]
    async fn test_skips_non_qemu_vendors() {
        let sysfs = tempfile::tempdir().unwrap();
        fixture_device(
            sysfs.path(),
            "2:0:0:1",
            "ATA\n",
            "naa.5043432d49443031\n",
            "sda",
        );

        let scanner = DeviceScanner::with_sysfs_path(sysfs.path())
            .with_timeout(Duration::from_millis(100));
        let err = scanner.discover_by_wwn("5043432d49443031").await.unwrap_err();
        assert!(matches!(err, HostError::DiscoveryTimeout { .. }));
    }

    #[tokio::test]
    async fn test_skips_non_naa_wwids() {
        let sysfs = tempfile::tempdir().unwrap();
        fixture_device(
            sysfs.path(),
            "2:0:0:1",
            "QEMU\n",
            "t10.5043432d49443031\n",
            "sda",
        );

        let scanner = DeviceScanner::with_sysfs_path(sysfs.path())
            .with_timeout(Duration::from_millis(100));
        assert!(scanner.discover_by_wwn("5043432d49443031").await.is_err());
    }

    #[tokio::test]
    async fn test_times_out_when_absent() {
        let sysfs = tempfile::tempdir().unwrap();

        let scanner = DeviceScanner::with_sysfs_path(sysfs.path())
            .with_timeout(Duration::from_millis(100));
        let err = scanner.discover_by_wwn("5043432d49443031").await.unwrap_err();
        match err {
            HostError::DiscoveryTimeout { wwn, .. } => {
                assert_eq!(wwn, "5043432d49443031");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
