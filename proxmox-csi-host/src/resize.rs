//! Online filesystem resize.

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HostError, Result};

/// Grow a filesystem to fill its (already resized) block device.
///
/// ext4 resizes by device, xfs by mountpoint.
pub async fn resize_filesystem(device: &str, mount_path: &str, fstype: &str) -> Result<()> {
    info!(device = %device, mount = %mount_path, fstype = %fstype, "Resizing filesystem");

    let (program, arg) = match fstype {
        "ext4" => ("resize2fs", device),
        "xfs" => ("xfs_growfs", mount_path),
        other => return Err(HostError::UnsupportedFilesystem(other.to_string())),
    };

    debug!(command = %format!("{} {}", program, arg), "Resize command");

    let output = Command::new(program).arg(arg).output().await?;
    if !output.status.success() {
        return Err(HostError::CommandFailed {
            command: program.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    info!(device = %device, "Filesystem resized");
    Ok(())
}

/// Determine the filesystem type on a device. Unlike
/// [`crate::format::check_filesystem`] a missing filesystem is an error
/// here: resize needs something to grow.
pub async fn filesystem_type(device: &str) -> Result<String> {
    let output = Command::new("blkid")
        .args(["-o", "value", "-s", "TYPE", device])
        .output()
        .await?;

    if output.status.success() {
        let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !fstype.is_empty() {
            return Ok(fstype);
        }
    }

    Err(HostError::NotFound(format!(
        "Cannot determine filesystem type for {}",
        device
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsupported_fstype() {
        let err = resize_filesystem("/dev/sda", "/mnt", "btrfs").await.unwrap_err();
        assert!(matches!(err, HostError::UnsupportedFilesystem(_)));
    }
}
