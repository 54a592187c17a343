//! Filesystem formatting.

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{HostError, Result};

/// Default filesystem when the volume capability names none.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Optional tuning knobs passed through to mkfs.
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    pub block_size: Option<u32>,
    pub inode_size: Option<u32>,
}

/// Build the mkfs invocation for a filesystem type.
///
/// `-F` / `-f` force past existing signatures; callers must have
/// verified via [`check_filesystem`] that the device is blank.
fn mkfs_args(device: &str, fstype: &str, options: &FormatOptions) -> Result<Vec<String>> {
    let mut cmd: Vec<String> = match fstype {
        "ext4" => {
            let mut cmd = vec!["mkfs.ext4".to_string(), "-F".to_string()];
            if let Some(block_size) = options.block_size {
                cmd.push("-b".to_string());
                cmd.push(block_size.to_string());
            }
            if let Some(inode_size) = options.inode_size {
                cmd.push("-I".to_string());
                cmd.push(inode_size.to_string());
            }
            cmd
        }
        "xfs" => {
            let mut cmd = vec!["mkfs.xfs".to_string(), "-f".to_string()];
            if let Some(block_size) = options.block_size {
                cmd.push("-b".to_string());
                cmd.push(format!("size={}", block_size));
            }
            if let Some(inode_size) = options.inode_size {
                cmd.push("-i".to_string());
                cmd.push(format!("size={}", inode_size));
            }
            cmd
        }
        other => {
            return Err(HostError::UnsupportedFilesystem(other.to_string()));
        }
    };

    cmd.push(device.to_string());
    Ok(cmd)
}

/// Format a block device with the given filesystem.
pub async fn format_device(device: &str, fstype: &str, options: &FormatOptions) -> Result<()> {
    info!(device = %device, fstype = %fstype, "Formatting device");

    let cmd = mkfs_args(device, fstype, options)?;
    debug!(command = %cmd.join(" "), "Format command");

    let output = Command::new(&cmd[0]).args(&cmd[1..]).output().await?;
    if !output.status.success() {
        return Err(HostError::CommandFailed {
            command: cmd[0].clone(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    info!(device = %device, fstype = %fstype, "Device formatted");
    Ok(())
}

/// Probe a device for an existing filesystem, returning its type.
/// `None` means the device carries no recognizable filesystem.
pub async fn check_filesystem(device: &str) -> Option<String> {
    let output = Command::new("blkid")
        .args(["-o", "value", "-s", "TYPE", device])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if fstype.is_empty() {
        None
    } else {
        Some(fstype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ext4_args() {
        let args = mkfs_args("/dev/sda", "ext4", &FormatOptions::default()).unwrap();
        assert_eq!(args, vec!["mkfs.ext4", "-F", "/dev/sda"]);
    }

    #[test]
    fn test_ext4_args_with_options() {
        let options = FormatOptions {
            block_size: Some(4096),
            inode_size: Some(256),
        };
        let args = mkfs_args("/dev/sda", "ext4", &options).unwrap();
        assert_eq!(
            args,
            vec!["mkfs.ext4", "-F", "-b", "4096", "-I", "256", "/dev/sda"]
        );
    }

    #[test]
    fn test_xfs_args_with_options() {
        let options = FormatOptions {
            block_size: Some(4096),
            inode_size: Some(512),
        };
        let args = mkfs_args("/dev/sdb", "xfs", &options).unwrap();
        assert_eq!(
            args,
            vec!["mkfs.xfs", "-f", "-b", "size=4096", "-i", "size=512", "/dev/sdb"]
        );
    }

    #[test]
    fn test_unsupported_fstype() {
        let err = mkfs_args("/dev/sda", "btrfs", &FormatOptions::default()).unwrap_err();
        assert!(matches!(err, HostError::UnsupportedFilesystem(_)));
    }
}
