//! Disk-quota admission.
//!
//! Admission runs before a pull commits network bandwidth. With a
//! configured usage limit the budget is `limit - used(root_dir)`, where
//! `used` is computed from filesystem block counts (hard links counted
//! once by inode); without a limit it is whatever `statvfs` reports as
//! available to unprivileged users.

use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use tracing::info;

use crate::artifact::ModelArtifact;
use crate::config::{format_bytes, Config};
use crate::error::{Error, Result};

/// Bytes used under `path`, from block counts.
///
/// Regular files and directories are deduplicated by inode so hard links
/// are charged once; symlinks contribute their own block cost; other entry
/// types are ignored. Block counts (rather than file sizes) keep sparse
/// files honest.
pub fn used_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut inodes: HashSet<u64> = HashSet::new();

    for entry in walkdir::WalkDir::new(path) {
        let entry =
            entry.map_err(|e| Error::Internal(format!("walk {}: {e}", path.display())))?;
        let meta = entry
            .metadata()
            .map_err(|e| Error::Internal(format!("stat {}: {e}", entry.path().display())))?;

        let file_type = entry.file_type();
        if file_type.is_file() || file_type.is_dir() {
            if inodes.insert(meta.ino()) {
                total += meta.blocks() * 512;
            }
        } else if file_type.is_symlink() {
            total += meta.blocks() * 512;
        }
    }

    Ok(total)
}

/// Bytes available on the filesystem containing `path`.
pub fn fs_available(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| Error::Internal(format!("statvfs {}: {e}", path.display())))?;
    Ok(stat.blocks_available() as u64 * stat.block_size() as u64)
}

/// Admits or rejects a pull against the configured disk budget.
pub struct DiskQuotaChecker {
    root_dir: std::path::PathBuf,
    disk_usage_limit: u64,
}

impl DiskQuotaChecker {
    pub fn new(cfg: &Config) -> Self {
        Self {
            root_dir: cfg.root_dir.clone(),
            disk_usage_limit: cfg.features.disk_usage_limit.bytes(),
        }
    }

    /// Reject with [`Error::InsufficientQuota`] if the artifact does not
    /// fit in the remaining budget.
    pub async fn admit(&self, artifact: &ModelArtifact, exclude_weights: bool) -> Result<()> {
        let avail: i64 = if self.disk_usage_limit > 0 {
            let used = used_size(&self.root_dir).map_err(|e| e.context("get root dir used size"))?;
            self.disk_usage_limit as i64 - used as i64
        } else {
            fs_available(&self.root_dir).map_err(|e| e.context("stat root dir"))? as i64
        };

        let start = std::time::Instant::now();
        let model_size = artifact
            .size(exclude_weights)
            .await
            .map_err(|e| e.context("get model size"))?;
        info!(
            "model {} size: {}, duration: {:?}",
            artifact.reference,
            format_bytes(model_size),
            start.elapsed()
        );

        info!(
            "root dir limit: {}, available: {}, model: {}",
            format_bytes(self.disk_usage_limit),
            format_signed(avail),
            format_bytes(model_size)
        );

        if model_size as i64 > avail {
            return Err(Error::InsufficientQuota(format!(
                "model image {} is {}, but only {} of disk quota is available",
                artifact.reference,
                format_bytes(model_size),
                format_signed(avail)
            )));
        }

        Ok(())
    }
}

fn format_signed(bytes: i64) -> String {
    if bytes >= 0 {
        format_bytes(bytes as u64)
    } else {
        format!("-{}", format_bytes(bytes.unsigned_abs()))
    }
}
