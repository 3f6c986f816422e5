//! Per-volume dynamic control servers.
//!
//! Each dynamic root volume owns an HTTP server bound to a UNIX socket
//! inside its own directory (`csi/csi.sock`), so the workload can manage
//! mounts from within its mount namespace. The manager tracks one server
//! per socket path and re-creates them on process start from the on-disk
//! volume tree.
//!
//! Binding uses a working-directory change to the socket's parent and the
//! socket's basename: the kernel caps `sun_path` at roughly 108 bytes, and
//! volume directories routinely push absolute socket paths past it.

mod handlers;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::volume::Provisioner;

pub struct DynamicServerManager {
    cfg: Arc<Config>,
    provisioner: Arc<Provisioner>,
    servers: Mutex<HashMap<PathBuf, ServerHandle>>,
}

struct ServerHandle {
    shutdown: CancellationToken,
}

impl DynamicServerManager {
    pub fn new(cfg: Arc<Config>, provisioner: Arc<Provisioner>) -> Self {
        Self {
            cfg,
            provisioner,
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or replace) the server bound to `sock_path` and start
    /// serving in the background.
    pub async fn create_server(&self, sock_path: &Path) -> Result<()> {
        // Replace any previous server for the same socket.
        if let Some(previous) = self.servers.lock().unwrap().remove(sock_path) {
            previous.shutdown.cancel();
        }

        fsutil::ensure_socket_absent(sock_path)
            .map_err(|e| e.context(format!("ensure socket not exists: {}", sock_path.display())))?;

        let listener = bind_unix(sock_path)
            .map_err(|e| e.context(format!("listen control sock: {}", sock_path.display())))?;

        let shutdown = CancellationToken::new();
        let app = handlers::router(self.provisioner.clone());

        {
            let sock_path = sock_path.to_path_buf();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let serve = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned());
                match serve.await {
                    Ok(()) => info!("http server closed: {}", sock_path.display()),
                    Err(err) => {
                        warn!("http server unexpectedly closed: {}: {err}", sock_path.display())
                    }
                }
            });
        }

        self.servers
            .lock()
            .unwrap()
            .insert(sock_path.to_path_buf(), ServerHandle { shutdown });

        info!("created dynamic server on {}", sock_path.display());
        Ok(())
    }

    /// Stop the server bound to `sock_path`, if any.
    pub fn close_server(&self, sock_path: &Path) -> Result<()> {
        let Some(handle) = self.servers.lock().unwrap().remove(sock_path) else {
            return Ok(());
        };

        handle.shutdown.cancel();
        if let Err(err) = std::fs::remove_file(sock_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("remove sock path {}: {err}", sock_path.display());
            }
        }

        info!("closed dynamic server on {}", sock_path.display());
        Ok(())
    }

    /// Re-create servers for every dynamic root volume found on disk.
    ///
    /// A `csi` directory on a different filesystem device than its volume
    /// belongs to a deprecated layout and is skipped.
    pub async fn recover(&self) -> Result<()> {
        let volumes_dir = self.cfg.volumes_dir();
        let entries = match std::fs::read_dir(&volumes_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(Error::Internal(format!(
                    "read volume dirs from {}: {e}",
                    volumes_dir.display()
                )))
            }
        };

        for entry in entries.flatten() {
            let volume_name = entry.file_name().to_string_lossy().into_owned();
            let csi_dir = self.cfg.csi_sock_dir(&volume_name);
            match std::fs::metadata(&csi_dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(Error::Internal(format!(
                        "stat control sock dir {}: {e}",
                        csi_dir.display()
                    )))
                }
            }

            let volume_dir = self.cfg.volume_dir(&volume_name);
            let same_device = fsutil::is_same_device(&volume_dir, &csi_dir)
                .map_err(|e| e.context(format!("check same device for volume dir: {}", volume_dir.display())))?;
            if !same_device {
                info!(
                    "skip recovering dynamic server on different device: {}",
                    csi_dir.display()
                );
                continue;
            }

            let sock_path = self.cfg.csi_sock_path(&volume_name);
            match self.create_server(&sock_path).await {
                Ok(()) => info!("recovered dynamic server on: {}", csi_dir.display()),
                Err(err) => error!(
                    "recover dynamic server on {}: {err}",
                    csi_dir.display()
                ),
            }
        }

        Ok(())
    }

    /// Stop every server. Used on shutdown.
    pub fn close_all(&self) {
        let mut servers = self.servers.lock().unwrap();
        for (sock_path, handle) in servers.drain() {
            handle.shutdown.cancel();
            info!("closed dynamic server on {}", sock_path.display());
        }
    }
}

/// Bind a UNIX listener at `sock_path` from its parent directory.
///
/// The process working directory is global state, so the chdir window is
/// serialized and restored before returning.
fn bind_unix(sock_path: &Path) -> Result<tokio::net::UnixListener> {
    static CWD_LOCK: Mutex<()> = Mutex::new(());

    let parent = sock_path
        .parent()
        .ok_or_else(|| Error::Internal(format!("no parent for sock path: {}", sock_path.display())))?;
    let name = sock_path
        .file_name()
        .ok_or_else(|| Error::Internal(format!("no file name in sock path: {}", sock_path.display())))?;

    let _guard = CWD_LOCK.lock().unwrap();

    let original = std::env::current_dir()
        .map_err(|e| Error::Internal(format!("getwd before chdir: {e}")))?;
    std::env::set_current_dir(parent)
        .map_err(|e| Error::Internal(format!("chdir to sock dir {}: {e}", parent.display())))?;

    let bound = tokio::net::UnixListener::bind(name)
        .map_err(|e| Error::Internal(format!("bind {}: {e}", sock_path.display())));

    let restored = std::env::set_current_dir(&original)
        .map_err(|e| Error::Internal(format!("restore workdir {}: {e}", original.display())));

    let listener = bound?;
    restored?;
    Ok(listener)
}
