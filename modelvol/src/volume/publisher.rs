//! Node publish / unpublish paths.
//!
//! A publish makes a volume visible at the workload's target path:
//!
//! - **static**: bind mount the previously pulled `model/` directory;
//! - **static-inline**: pull synchronously, then bind mount;
//! - **dynamic root**: ensure `models/` and the control socket, then
//!   recursively bind mount the volume directory so the workload sees
//!   both.
//!
//! Publish is idempotent: an already-mounted target succeeds immediately.

use std::collections::HashMap;
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::dynserver::DynamicServerManager;
use crate::error::{Error, Result};
use crate::fsutil;
use crate::mount::{bind, rbind, Mounter};
use crate::status::{State, Status, StatusStore};
use crate::telemetry::ObservationSink;
use crate::worker::{PullRequest, Worker};

use super::{classify, is_static_volume, VolumeKind};

pub struct Publisher {
    cfg: Arc<Config>,
    store: Arc<StatusStore>,
    worker: Arc<Worker>,
    mounter: Arc<dyn Mounter>,
    servers: Arc<DynamicServerManager>,
    sink: Arc<dyn ObservationSink>,
}

impl Publisher {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<StatusStore>,
        worker: Arc<Worker>,
        mounter: Arc<dyn Mounter>,
        servers: Arc<DynamicServerManager>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        Self {
            cfg,
            store,
            worker,
            mounter,
            servers,
            sink,
        }
    }

    /// Publish `volume_name` at `target_path`.
    pub async fn publish(
        &self,
        volume_name: &str,
        target_path: &Path,
        volume_context: &HashMap<String, String>,
    ) -> Result<()> {
        let start = Instant::now();
        let result = self
            .publish_inner(volume_name, target_path, volume_context)
            .await;
        let op = if is_static_volume(volume_name) {
            "publish_volume"
        } else {
            "publish_dynamic_volume"
        };
        self.sink.op_observed(op, start.elapsed(), result.is_ok());
        result
    }

    async fn publish_inner(
        &self,
        volume_name: &str,
        target_path: &Path,
        volume_context: &HashMap<String, String>,
    ) -> Result<()> {
        if volume_name.is_empty() {
            return Err(Error::InvalidArgument(
                "missing required parameter: volumeId".into(),
            ));
        }
        if target_path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "missing required parameter: targetPath".into(),
            ));
        }

        info!("publishing volume {volume_name} at {}", target_path.display());

        if self
            .mounter
            .is_mounted(target_path)
            .await
            .map_err(|e| e.context("check if target path is mounted"))?
        {
            info!("target path is already mounted");
            return Ok(());
        }

        self.mounter
            .ensure_mount_point(target_path)
            .await
            .map_err(|e| e.context("ensure mount point"))?;

        let inline_reference = volume_context
            .get(&self.cfg.parameter_key_reference())
            .map(|r| r.trim())
            .filter(|r| !r.is_empty());

        match classify(volume_name, inline_reference) {
            VolumeKind::Static => self.publish_static(volume_name, target_path).await,
            VolumeKind::StaticInline => {
                let reference = inline_reference.unwrap_or_default();
                info!("publishing static inline volume: {reference}");
                self.publish_inline(volume_name, target_path, reference)
                    .await
            }
            VolumeKind::DynamicRoot => self.publish_dynamic_root(volume_name, target_path).await,
        }
    }

    async fn publish_static(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        let status_path = self.cfg.volume_status_path(volume_name);
        let mut status = self
            .store
            .get(&status_path)
            .map_err(|e| e.context("get volume status"))?;

        let source_path = self.cfg.model_dir(&status.volume_name);
        self.mounter
            .mount(bind(&source_path).mount_point(target_path))
            .await
            .map_err(|e| e.context(format!("bind mount {} to target", source_path.display())))?;

        status.state = Some(State::Mounted);
        self.store
            .set(&status_path, &status)
            .map_err(|e| e.context("set volume status"))
    }

    async fn publish_inline(
        &self,
        volume_name: &str,
        target_path: &Path,
        reference: &str,
    ) -> Result<()> {
        let model_dir = self.cfg.model_dir(volume_name);

        let started = Instant::now();
        self.worker
            .pull_model(PullRequest {
                volume_name: volume_name.to_string(),
                reference: reference.to_string(),
                ..Default::default()
            })
            .await
            .map_err(|e| e.context("pull model"))?;
        info!("pulled model: {reference} {:?}", started.elapsed());

        self.mounter
            .mount(bind(&model_dir).mount_point(target_path))
            .await
            .map_err(|e| {
                e.context(format!(
                    "bind mount {} to target {}",
                    model_dir.display(),
                    target_path.display()
                ))
            })?;

        let status_path = self.cfg.volume_status_path(volume_name);
        let mut status = self
            .store
            .get(&status_path)
            .map_err(|e| e.context("get volume status"))?;

        // The field distinguishes inline and provisioned volumes.
        status.inline = true;
        status.state = Some(State::Mounted);
        self.store
            .set(&status_path, &status)
            .map_err(|e| e.context("set volume status"))
    }

    async fn publish_dynamic_root(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        let models_dir = self.cfg.models_dir(volume_name);
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&models_dir)
            .map_err(|e| Error::Internal(format!("create source models dir: {e}")))?;

        let sock_path = self.cfg.csi_sock_path(volume_name);
        self.servers
            .create_server(&sock_path)
            .await
            .map_err(|e| e.context("create dynamic control server"))?;

        let volume_dir = self.cfg.volume_dir(volume_name);
        self.store
            .set(
                &self.cfg.volume_status_path(volume_name),
                &Status {
                    volume_name: volume_name.to_string(),
                    ..Default::default()
                },
            )
            .map_err(|e| e.context("create volume status"))?;

        self.mounter
            .mount(rbind(&volume_dir).mount_point(target_path))
            .await
            .map_err(|e| e.context(format!("bind mount {} to target", volume_dir.display())))
    }

    /// Unpublish the volume at `target_path`.
    pub async fn unpublish(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        let start = Instant::now();
        let result = self.unpublish_inner(volume_name, target_path).await;
        let op = if is_static_volume(volume_name) {
            "unpublish_volume"
        } else {
            "unpublish_dynamic_volume"
        };
        self.sink.op_observed(op, start.elapsed(), result.is_ok());
        result
    }

    async fn unpublish_inner(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        if volume_name.is_empty() {
            return Err(Error::InvalidArgument(
                "missing required parameter: volumeId".into(),
            ));
        }
        if target_path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "missing required parameter: targetPath".into(),
            ));
        }

        info!(
            "unpublishing volume {volume_name} at {}",
            target_path.display()
        );

        if !self
            .mounter
            .is_mounted(target_path)
            .await
            .map_err(|e| e.context("check if target path is mounted"))?
        {
            info!("target path is already umounted");
            return Ok(());
        }

        if is_static_volume(volume_name) {
            return self.unpublish_static(volume_name, target_path).await;
        }

        let status = self.store.get(&self.cfg.volume_status_path(volume_name));
        if let Ok(status) = &status {
            if status.inline {
                info!("unpublishing static inline volume: {}", status.reference);
                return self.unpublish_inline(volume_name, target_path).await;
            }
        }

        self.unpublish_dynamic(volume_name, target_path).await
    }

    async fn unpublish_static(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        self.mounter
            .unmount(target_path, true)
            .await
            .map_err(|e| e.context("unmount target path"))?;

        let status_path = self.cfg.volume_status_path(volume_name);
        let mut status = match self.store.get(&status_path) {
            Ok(status) => status,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.context("get volume status")),
        };

        status.state = Some(State::Umounted);
        self.store
            .set(&status_path, &status)
            .map_err(|e| e.context("set volume status"))
    }

    async fn unpublish_inline(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        if let Err(err) = self.mounter.unmount(target_path, true).await {
            error!("unmount target path: {err}");
        }

        let volume_dir = self.cfg.volume_dir(volume_name);
        std::fs::remove_dir_all(&volume_dir).map_err(|e| {
            Error::Internal(format!(
                "remove static inline volume dir {}: {e}",
                volume_dir.display()
            ))
        })
    }

    async fn unpublish_dynamic(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        let csi_dir = self.cfg.csi_sock_dir(volume_name);
        let volume_dir = self.cfg.volume_dir(volume_name);

        let same_device = match fsutil::is_same_device(&csi_dir, &volume_dir) {
            Ok(same) => same,
            Err(err) => {
                warn!("check same device for csi dir and volume dir: {err}");
                false
            }
        };
        info!("csi dir and volume dir on same device: {same_device}");

        if same_device {
            let sock_path = self.cfg.csi_sock_path(volume_name);
            if let Err(err) = self.servers.close_server(&sock_path) {
                error!("close dynamic control server: {err}");
            }
        } else {
            // Leftover of a deprecated layout that bind mounted the csi
            // directory from another filesystem.
            if let Err(err) = self.mounter.unmount(&csi_dir, true).await {
                warn!("unmount csi directory path: {err}");
            }
        }

        self.mounter
            .unmount(target_path, true)
            .await
            .map_err(|e| e.context("unmount target path"))?;

        std::fs::remove_dir_all(&volume_dir).map_err(|e| {
            Error::Internal(format!(
                "remove dynamic volume dir {}: {e}",
                volume_dir.display()
            ))
        })
    }
}
