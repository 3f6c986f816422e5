//! Small filesystem helpers shared across modules.

use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};

/// Whether two paths live on the same filesystem device.
pub fn is_same_device(a: &Path, b: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let meta_a = std::fs::metadata(a)
        .map_err(|e| Error::Internal(format!("stat path {}: {e}", a.display())))?;
    let meta_b = std::fs::metadata(b)
        .map_err(|e| Error::Internal(format!("stat path {}: {e}", b.display())))?;
    Ok(meta_a.dev() == meta_b.dev())
}

/// Make sure nothing is in the way of binding a socket at `path`: remove a
/// leftover socket file and create the parent directory.
pub fn ensure_socket_absent(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                return Err(Error::Internal(format!(
                    "sock path is a directory: {}",
                    path.display()
                )));
            }
            std::fs::remove_file(path).map_err(|e| {
                Error::Internal(format!("remove existed sock path {}: {e}", path.display()))
            })?;
            info!("removed existed sock path: {}", path.display());
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(Error::Internal(format!(
                "stat sock path {}: {e}",
                path.display()
            )))
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::Internal(format!("create sock path dir {}: {e}", parent.display()))
        })?;
    }
    Ok(())
}
