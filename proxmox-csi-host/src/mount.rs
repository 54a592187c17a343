//! Mount, bind-mount and unmount operations.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{HostError, Result};

/// Deadline for the best-effort fstrim before unmount.
const FSTRIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Mount a device on a target directory, creating the directory first.
pub async fn mount_device(
    device: &str,
    target: &str,
    fstype: &str,
    options: &[String],
) -> Result<()> {
    info!(device = %device, target = %target, fstype = %fstype, "Mounting device");

    std::fs::create_dir_all(target)?;

    let mut cmd = Command::new("mount");
    cmd.args(["-t", fstype]);
    if !options.is_empty() {
        cmd.args(["-o", &options.join(",")]);
    }
    cmd.args([device, target]);

    run_checked(cmd, "mount").await?;

    info!(device = %device, target = %target, "Device mounted");
    Ok(())
}

/// Bind-mount `source` onto `target`.
///
/// When the source is a regular file (the raw-block device-node case)
/// the target must be a file too; otherwise it is a directory.
pub async fn bind_mount(source: &str, target: &str, readonly: bool) -> Result<()> {
    info!(source = %source, target = %target, readonly = readonly, "Bind mounting");

    let source_path = Path::new(source);
    if source_path.is_file() {
        if let Some(parent) = Path::new(target).parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !Path::new(target).exists() {
            std::fs::File::create(target)?;
        }
    } else {
        std::fs::create_dir_all(target)?;
    }

    let options = if readonly { "bind,ro" } else { "bind" };

    let mut cmd = Command::new("mount");
    cmd.args(["-o", options, source, target]);
    run_checked(cmd, "mount").await?;

    info!(source = %source, target = %target, "Bind mount created");
    Ok(())
}

/// Unmount a target path, trimming the filesystem first on a best-effort
/// basis.
pub async fn unmount_path(target: &str) -> Result<()> {
    info!(target = %target, "Unmounting");

    // fstrim failures and timeouts never block the unmount.
    let trim = Command::new("fstrim")
        .args(["-v", target])
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(FSTRIM_TIMEOUT, trim).await {
        Ok(Ok(output)) if !output.status.success() => {
            debug!(target = %target, "fstrim failed (ignored)");
        }
        Ok(Err(e)) => debug!(target = %target, error = %e, "fstrim not runnable (ignored)"),
        Err(_) => warn!(target = %target, "fstrim timed out (ignored)"),
        _ => {}
    }

    let mut cmd = Command::new("umount");
    cmd.arg(target);
    run_checked(cmd, "umount").await?;

    info!(target = %target, "Unmounted");
    Ok(())
}

/// Whether `path` is a mountpoint, by exact match against the mount
/// table.
pub fn is_mounted(path: &str) -> bool {
    match std::fs::read_to_string("/proc/mounts") {
        Ok(table) => is_mounted_in(&table, path),
        Err(_) => false,
    }
}

/// Exact mountpoint lookup in a mounts-table text.
pub fn is_mounted_in(table: &str, path: &str) -> bool {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mountpoint| mountpoint == path)
}

/// The device mounted at `mount_path`, if any.
pub fn get_device_from_mount(mount_path: &str) -> Option<String> {
    let table = std::fs::read_to_string("/proc/mounts").ok()?;
    device_for_mount_in(&table, mount_path)
}

/// Exact mountpoint-to-device lookup in a mounts-table text.
pub fn device_for_mount_in(table: &str, mount_path: &str) -> Option<String> {
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        if fields.next() == Some(mount_path) {
            return Some(device.to_string());
        }
    }
    None
}

async fn run_checked(mut cmd: Command, name: &str) -> Result<()> {
    let output = cmd.output().await?;
    if !output.status.success() {
        return Err(HostError::CommandFailed {
            command: name.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/sdb /var/lib/kubelet/pods/x/volumes/kubernetes.io~csi/pvc-1/mount ext4 rw 0 0
tmpfs /run tmpfs rw,nosuid 0 0
";

    #[test]
    fn test_is_mounted_exact_match() {
        assert!(is_mounted_in(TABLE, "/run"));
        assert!(is_mounted_in(
            TABLE,
            "/var/lib/kubelet/pods/x/volumes/kubernetes.io~csi/pvc-1/mount"
        ));
    }

    #[test]
    fn test_is_mounted_rejects_substrings() {
        // A prefix of a mountpoint is not itself mounted.
        assert!(!is_mounted_in(TABLE, "/var/lib/kubelet"));
        assert!(!is_mounted_in(TABLE, "/ru"));
        // Neither is a device path.
        assert!(!is_mounted_in(TABLE, "/dev/sdb"));
    }

    #[test]
    fn test_device_for_mount() {
        assert_eq!(
            device_for_mount_in(
                TABLE,
                "/var/lib/kubelet/pods/x/volumes/kubernetes.io~csi/pvc-1/mount"
            ),
            Some("/dev/sdb".to_string())
        );
        assert_eq!(device_for_mount_in(TABLE, "/nonexistent"), None);
    }
}
