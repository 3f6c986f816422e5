//! Volume and mount provisioning.
//!
//! Create/delete of static volumes and dynamic mounts, plus the status
//! lookups behind the dynamic HTTP API. Publishing (bind mounts) is the
//! [`super::Publisher`]'s job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::api::MountRequest;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::status::{Status, StatusStore};
use crate::worker::{PullRequest, Worker};

/// The only model type the driver understands.
const MODEL_TYPE_IMAGE: &str = "image";

pub struct Provisioner {
    cfg: Arc<Config>,
    store: Arc<StatusStore>,
    worker: Arc<Worker>,
}

impl Provisioner {
    pub fn new(cfg: Arc<Config>, store: Arc<StatusStore>, worker: Arc<Worker>) -> Self {
        Self { cfg, store, worker }
    }

    /// Create a volume from dispatcher parameters (namespaced under the
    /// service name). Returns the volume id: the volume name for static
    /// volumes, `<volume>/<mount>` for dynamic mounts.
    pub async fn create_volume(
        &self,
        volume_name: &str,
        parameters: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let param = |key: String| {
            parameters
                .get(&key)
                .map(|v| v.trim().to_string())
                .unwrap_or_default()
        };

        let model_type = param(self.cfg.parameter_key_type());
        let reference = param(self.cfg.parameter_key_reference());
        let mount_id = param(self.cfg.parameter_key_mount_id());
        let check_disk_quota_param = param(self.cfg.parameter_key_check_disk_quota());

        if volume_name.is_empty() {
            return Err(Error::InvalidArgument(
                "missing required parameter: volumeName".into(),
            ));
        }
        if model_type.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "missing required parameter: {}",
                self.cfg.parameter_key_type()
            )));
        }
        if model_type != MODEL_TYPE_IMAGE {
            return Err(Error::InvalidArgument(format!(
                "unsupported model type: {model_type}"
            )));
        }
        if reference.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "missing required parameter: {}",
                self.cfg.parameter_key_reference()
            )));
        }
        let check_disk_quota = if check_disk_quota_param.is_empty() {
            false
        } else {
            check_disk_quota_param.parse::<bool>().map_err(|e| {
                Error::InvalidArgument(format!(
                    "invalid parameter {}: {e}",
                    self.cfg.parameter_key_check_disk_quota()
                ))
            })?
        };

        if mount_id.is_empty() {
            self.pull(
                volume_name,
                "",
                &reference,
                check_disk_quota,
                false,
                Vec::new(),
                timeout,
            )
            .await?;
            Ok(volume_name.to_string())
        } else {
            self.ensure_dynamic_volume_exists(volume_name)?;
            self.pull(
                volume_name,
                &mount_id,
                &reference,
                check_disk_quota,
                false,
                Vec::new(),
                timeout,
            )
            .await?;
            Ok(format!("{volume_name}/{mount_id}"))
        }
    }

    /// Create a dynamic mount from an HTTP request body and return its
    /// resulting status.
    pub async fn create_mount(&self, volume_name: &str, req: &MountRequest) -> Result<Status> {
        self.ensure_dynamic_volume_exists(volume_name)?;

        self.pull(
            volume_name,
            &req.mount_id,
            &req.reference,
            req.check_disk_quota,
            req.exclude_model_weights,
            req.exclude_file_patterns.clone(),
            None,
        )
        .await?;

        self.get_dynamic_mount(volume_name, &req.mount_id)
    }

    async fn pull(
        &self,
        volume_name: &str,
        mount_id: &str,
        reference: &str,
        check_disk_quota: bool,
        exclude_model_weights: bool,
        exclude_file_patterns: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let started = std::time::Instant::now();
        self.worker
            .pull_model(PullRequest {
                volume_name: volume_name.to_string(),
                mount_id: mount_id.to_string(),
                reference: reference.to_string(),
                check_disk_quota,
                exclude_model_weights,
                exclude_file_patterns,
                timeout,
            })
            .await?;
        info!(
            "pulled model: {reference} {:?}",
            started.elapsed()
        );
        Ok(())
    }

    /// A dynamic mount can only land inside an existing root volume.
    fn ensure_dynamic_volume_exists(&self, volume_name: &str) -> Result<()> {
        let volume_dir = self.cfg.volume_dir(volume_name);
        match std::fs::metadata(&volume_dir) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Internal(format!(
                "volume directory does not exist: {}",
                volume_dir.display()
            ))),
            Err(e) => Err(Error::Internal(format!(
                "stat volume directory {}: {e}",
                volume_dir.display()
            ))),
        }
    }

    /// Delete by volume id: `<volume>` for static volumes,
    /// `<volume>/<mount>` for dynamic mounts.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        if volume_id.is_empty() {
            return Err(Error::InvalidArgument(
                "missing required parameter: volumeId".into(),
            ));
        }

        let parts: Vec<&str> = volume_id.split('/').collect();
        match parts.as_slice() {
            [volume_name] => self.worker.delete_model(volume_name, "").await,
            [volume_name, mount_id] => self.worker.delete_model(volume_name, mount_id).await,
            _ => Err(Error::InvalidArgument(format!(
                "invalid volumeId format: {volume_id}"
            ))),
        }
    }

    /// Status of one dynamic mount.
    pub fn get_dynamic_mount(&self, volume_name: &str, mount_id: &str) -> Result<Status> {
        self.store
            .get(&self.cfg.mount_status_path(volume_name, mount_id))
    }

    /// Statuses of every mount under a dynamic root volume, in name order.
    pub fn list_dynamic_mounts(&self, volume_name: &str) -> Result<Vec<Status>> {
        let models_dir = self.cfg.models_dir(volume_name);
        let entries = std::fs::read_dir(&models_dir).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("models dir not found: {}", models_dir.display()))
            } else {
                Error::Internal(format!("read models dir {}: {e}", models_dir.display()))
            }
        })?;

        let mut mount_ids: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        mount_ids.sort();

        let mut statuses = Vec::with_capacity(mount_ids.len());
        for mount_id in mount_ids {
            match self.get_dynamic_mount(volume_name, &mount_id) {
                Ok(status) => statuses.push(status),
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    error!("failed to get volume status: {err}");
                    return Err(err);
                }
            }
        }
        Ok(statuses)
    }

    /// Statuses of every volume that has one, in name order. Volumes
    /// without a status document are skipped.
    pub fn list_volumes(&self) -> Result<Vec<Status>> {
        let volumes_dir = self.cfg.volumes_dir();
        let entries = match std::fs::read_dir(&volumes_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::Internal(format!(
                    "read volumes dir {}: {e}",
                    volumes_dir.display()
                )))
            }
        };

        let mut volume_names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        volume_names.sort();

        let mut statuses = Vec::new();
        for volume_name in volume_names {
            match self.store.get(&self.cfg.volume_status_path(&volume_name)) {
                Ok(status) => statuses.push(status),
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(statuses)
    }
}
