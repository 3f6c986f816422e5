//! Fluent construction of mount commands.
//!
//! Three commands are supported (a size-limited `tmpfs` mount, a `bind`
//! mount, and a recursive `rbind` mount), each terminated by a mount
//! point. [`MountSpec::build`] creates the target directory and returns
//! the executable command value.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// tmpfs mounts are capped at 2 GiB regardless of the requested size.
const TMPFS_MAX_SIZE_BYTES: u64 = 2 << 30;

/// Start a tmpfs mount of at most `size_in_bytes`.
pub fn tmpfs(size_in_bytes: u64) -> Tmpfs {
    Tmpfs {
        size_in_bytes: size_in_bytes.min(TMPFS_MAX_SIZE_BYTES),
    }
}

/// Start a bind mount from `source`.
pub fn bind(source: impl Into<PathBuf>) -> Bind {
    Bind {
        flag: "--bind",
        source: source.into(),
    }
}

/// Start a recursive bind mount from `source`.
pub fn rbind(source: impl Into<PathBuf>) -> Bind {
    Bind {
        flag: "--rbind",
        source: source.into(),
    }
}

pub struct Tmpfs {
    size_in_bytes: u64,
}

impl Tmpfs {
    pub fn mount_point(self, path: impl Into<PathBuf>) -> MountSpec {
        MountSpec {
            args: vec![
                "-t".into(),
                "tmpfs".into(),
                "-o".into(),
                format!("size={}", self.size_in_bytes),
                "tmpfs".into(),
            ],
            target: path.into(),
        }
    }
}

pub struct Bind {
    flag: &'static str,
    source: PathBuf,
}

impl Bind {
    pub fn mount_point(self, path: impl Into<PathBuf>) -> MountSpec {
        MountSpec {
            args: vec![self.flag.into(), self.source.to_string_lossy().into_owned()],
            target: path.into(),
        }
    }
}

/// A fully specified mount, ready to build.
pub struct MountSpec {
    args: Vec<String>,
    target: PathBuf,
}

impl MountSpec {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Create the target directory (mode 0777) and produce the command.
    pub fn build(self) -> Result<MountCmd> {
        if self.target.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("mount point is required".into()));
        }
        DirBuilder::new()
            .recursive(true)
            .mode(0o777)
            .create(&self.target)
            .map_err(|e| {
                Error::Internal(format!(
                    "create mount target {}: {e}",
                    self.target.display()
                ))
            })?;

        let mut args = self.args;
        args.push(self.target.to_string_lossy().into_owned());

        Ok(MountCmd {
            command: "mount",
            args,
        })
    }
}

/// An executable mount command.
#[derive(Debug, Clone)]
pub struct MountCmd {
    command: &'static str,
    args: Vec<String>,
}

impl MountCmd {
    pub fn command(&self) -> &str {
        self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl std::fmt::Display for MountCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.command, self.args.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bind_args() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let cmd = bind("/src/model").mount_point(&target).build().unwrap();
        assert_eq!(cmd.command(), "mount");
        assert_eq!(
            cmd.args(),
            &[
                "--bind".to_string(),
                "/src/model".to_string(),
                target.to_string_lossy().into_owned(),
            ]
        );
        assert!(target.is_dir());
    }

    #[test]
    fn test_rbind_args() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let cmd = rbind("/src/volume").mount_point(&target).build().unwrap();
        assert_eq!(cmd.args()[0], "--rbind");
    }

    #[test]
    fn test_tmpfs_args() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let cmd = tmpfs(1024 * 1024).mount_point(&target).build().unwrap();
        assert_eq!(
            cmd.args()[..5],
            [
                "-t".to_string(),
                "tmpfs".to_string(),
                "-o".to_string(),
                "size=1048576".to_string(),
                "tmpfs".to_string(),
            ]
        );
    }

    #[test]
    fn test_tmpfs_size_is_clamped() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("target");
        let cmd = tmpfs(u64::MAX).mount_point(&target).build().unwrap();
        assert_eq!(cmd.args()[3], format!("size={}", 2u64 << 30));
    }

    #[test]
    fn test_empty_mount_point_is_rejected() {
        let err = bind("/src").mount_point("").build().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
