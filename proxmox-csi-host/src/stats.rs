//! Filesystem usage statistics via statvfs.

use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;

use crate::error::{HostError, Result};

/// Byte and inode usage of a mounted filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub available_inodes: u64,
    pub used_inodes: u64,
}

/// Query filesystem statistics for a path.
pub fn filesystem_stats(path: &str) -> Result<FsStats> {
    let c_path = CString::new(path)
        .map_err(|_| HostError::NotFound(format!("Invalid path: {}", path)))?;

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(HostError::Io(io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };

    let frsize = stat.f_frsize as u64;
    let total_bytes = stat.f_blocks as u64 * frsize;
    let available_bytes = stat.f_bavail as u64 * frsize;
    let total_inodes = stat.f_files as u64;
    let available_inodes = stat.f_favail as u64;

    Ok(FsStats {
        total_bytes,
        available_bytes,
        used_bytes: total_bytes.saturating_sub(available_bytes),
        total_inodes,
        available_inodes,
        used_inodes: total_inodes.saturating_sub(available_inodes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_on_root() {
        let stats = filesystem_stats("/").unwrap();
        assert!(stats.total_bytes > 0);
        assert!(stats.used_bytes <= stats.total_bytes);
    }

    #[test]
    fn test_stats_on_missing_path() {
        assert!(filesystem_stats("/nonexistent-proxmox-csi-test").is_err());
    }
}
