//! Mount execution and mount-table inspection.
//!
//! [`Mounter`] is the seam between the orchestrator and the operating
//! system: the production implementation shells out to the `mount` and
//! `umount` tools, while tests substitute an in-memory implementation.

mod builder;

pub use builder::{bind, rbind, tmpfs, MountCmd, MountSpec};

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};

/// Mount operations used by the volume orchestrator.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Build and execute a mount command.
    async fn mount(&self, spec: MountSpec) -> Result<()>;

    /// Unmount `target`. "Not mounted" is success.
    async fn unmount(&self, target: &Path, lazy: bool) -> Result<()>;

    /// Whether `target` currently appears in the mount table, by exact
    /// mountpoint equality. A missing path is not mounted.
    async fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Create `target` (mode 0755) if it does not exist.
    async fn ensure_mount_point(&self, target: &Path) -> Result<()>;
}

/// [`Mounter`] backed by the system `mount`/`umount` executables and
/// `/proc/self/mountinfo`.
#[derive(Default)]
pub struct SysMounter;

impl SysMounter {
    pub fn new() -> Self {
        Self
    }
}

async fn exec(command: &str, args: &[String]) -> Result<String> {
    info!("exec command: {} {}", command, args.join(" "));
    let output = tokio::process::Command::new(command)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::Internal(format!("spawn {command}: {e}")))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    if !output.status.success() {
        return Err(Error::Internal(format!(
            "{command} exited with {}: {}",
            output.status,
            combined.trim()
        )));
    }
    Ok(combined)
}

#[async_trait]
impl Mounter for SysMounter {
    async fn mount(&self, spec: MountSpec) -> Result<()> {
        let cmd = spec.build()?;
        exec(cmd.command(), cmd.args())
            .await
            .map_err(|e| e.context(format!("mount failed: '{cmd}'")))?;
        Ok(())
    }

    async fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        if target.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "target is not specified for unmounting the volume".into(),
            ));
        }

        let mut args = Vec::new();
        if lazy {
            args.push("--lazy".to_string());
        }
        args.push(target.to_string_lossy().into_owned());

        match exec("umount", &args).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let msg = err.to_string();
                if msg.contains("not mounted") || msg.contains("mountpoint not found") {
                    return Ok(());
                }
                Err(err.context(format!("unmount {}", target.display())))
            }
        }
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        match std::fs::symlink_metadata(target) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(Error::Internal(format!(
                    "stat mount point {}: {e}",
                    target.display()
                )))
            }
        }

        let table = tokio::fs::read_to_string("/proc/self/mountinfo")
            .await
            .map_err(|e| Error::Internal(format!("read mountinfo: {e}")))?;

        let target = target.to_string_lossy();
        Ok(table
            .lines()
            .filter_map(mountinfo_mount_point)
            .any(|mount_point| mount_point == target))
    }

    async fn ensure_mount_point(&self, target: &Path) -> Result<()> {
        match std::fs::symlink_metadata(target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(target)
                .map_err(|e| {
                    Error::Internal(format!("create mount point {}: {e}", target.display()))
                }),
            Err(e) => Err(Error::Internal(format!(
                "stat mount point {}: {e}",
                target.display()
            ))),
        }
    }
}

/// Extract the mount point (field 5) from one `mountinfo` line, decoding
/// the kernel's octal escapes.
fn mountinfo_mount_point(line: &str) -> Option<String> {
    let field = line.split_whitespace().nth(4)?;
    Some(unescape_mountinfo(field))
}

fn unescape_mountinfo(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut rest = field;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let escape = rest.get(pos + 1..pos + 4);
        match escape.and_then(|oct| u8::from_str_radix(oct, 8).ok()) {
            Some(code) => {
                out.push(code as char);
                rest = &rest[pos + 4..];
            }
            None => {
                out.push('\\');
                rest = &rest[pos + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}
