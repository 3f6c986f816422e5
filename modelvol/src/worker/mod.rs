//! Top-level pull/delete engine.
//!
//! Two keys govern every operation on a `(volume, mount)` pair:
//!
//! - the **inflight key** (`pull-<vol>/<mount>` or `delete-<vol>/<mount>`)
//!   coalesces concurrent callers of the same operation onto a single
//!   execution;
//! - the **scope key** (`<vol>/<mount>`) serializes pull against delete
//!   and addresses the cancellation handle of an active pull.
//!
//! These stay separate on purpose: a delete first fires the cancel handle
//! for the scope, then queues on the scope lock, which the cancelled pull
//! releases on its way out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, STATUS_FILE};
use crate::error::{Error, Result};
use crate::backend::{PullBackend, RegistryKeychain};
use crate::pull::{ModelPuller, ProgressHook};
use crate::quota::DiskQuotaChecker;
use crate::status::{Progress, State, Status, StatusStore};
use crate::sync::{with_retry, FlightGroup, KeyedMutex, RetryError};
use crate::telemetry::ObservationSink;
use crate::volume::is_static_volume;

const DELETE_RETRY_ATTEMPTS: u32 = 60;
const DELETE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One pull order. The mount id is empty for static and inline volumes.
#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    pub volume_name: String,
    pub mount_id: String,
    pub reference: String,
    pub check_disk_quota: bool,
    pub exclude_model_weights: bool,
    pub exclude_file_patterns: Vec<String>,
    /// Overall deadline for the pull; exceeding it yields
    /// [`Error::DeadlineExceeded`] and a `PULL_TIMEOUT` status.
    pub timeout: Option<Duration>,
}

impl PullRequest {
    fn inflight_key(&self) -> String {
        format!("pull-{}/{}", self.volume_name, self.mount_id)
    }

    fn scope_key(&self) -> String {
        format!("{}/{}", self.volume_name, self.mount_id)
    }
}

/// Cancellation handles of active pulls, addressed by scope key.
#[derive(Clone, Default)]
struct CancelMap {
    inner: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

/// Removes the handle when the pull leaves its critical section.
struct CancelRegistration {
    map: CancelMap,
    key: String,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.map.inner.lock().unwrap().remove(&self.key);
    }
}

impl CancelMap {
    fn register(&self, key: &str, token: CancellationToken) -> CancelRegistration {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), token);
        CancelRegistration {
            map: self.clone(),
            key: key.to_string(),
        }
    }

    fn get(&self, key: &str) -> Option<CancellationToken> {
        self.inner.lock().unwrap().get(key).cloned()
    }
}

/// Writes the status document for one materialized unit.
#[derive(Clone)]
struct StatusWriter {
    store: Arc<StatusStore>,
    path: PathBuf,
    volume_name: String,
    mount_id: String,
    reference: String,
}

impl StatusWriter {
    fn write(&self, state: State, progress: Progress) -> Result<()> {
        self.store
            .set(
                &self.path,
                &Status {
                    volume_name: self.volume_name.clone(),
                    mount_id: self.mount_id.clone(),
                    reference: self.reference.clone(),
                    state: Some(state),
                    inline: false,
                    progress,
                },
            )
            .map_err(|e| e.context("set model status"))
    }
}

pub struct Worker {
    cfg: Arc<Config>,
    store: Arc<StatusStore>,
    backend: Arc<dyn PullBackend>,
    keychain: Arc<dyn RegistryKeychain>,
    sink: Arc<dyn ObservationSink>,
    inflight: FlightGroup,
    cancels: CancelMap,
    scopes: KeyedMutex,
}

impl Worker {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<StatusStore>,
        backend: Arc<dyn PullBackend>,
        keychain: Arc<dyn RegistryKeychain>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        Self {
            cfg,
            store,
            backend,
            keychain,
            sink,
            inflight: FlightGroup::new(),
            cancels: CancelMap::default(),
            scopes: KeyedMutex::new(),
        }
    }

    fn model_dir(&self, volume_name: &str, mount_id: &str) -> PathBuf {
        if mount_id.is_empty() {
            self.cfg.model_dir(volume_name)
        } else {
            self.cfg.mount_model_dir(volume_name, mount_id)
        }
    }

    fn scoped_dir(&self, volume_name: &str, mount_id: &str) -> PathBuf {
        if mount_id.is_empty() {
            self.cfg.volume_dir(volume_name)
        } else {
            self.cfg.mount_dir(volume_name, mount_id)
        }
    }

    /// Pull a model. Concurrent calls for the same `(volume, mount)` share
    /// one pull; a failure (other than a reference conflict) tears the
    /// partial materialization back down before returning.
    pub async fn pull_model(&self, req: PullRequest) -> Result<()> {
        let start = Instant::now();
        let result = self.pull_model_inner(&req).await;
        self.sink
            .op_observed("pull_model", start.elapsed(), result.is_ok());

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_conflict() => Err(err),
            Err(err) => {
                if let Err(delete_err) = self
                    .delete_model(&req.volume_name, &req.mount_id)
                    .await
                {
                    return Err(err.context(format!("delete model: {delete_err}")));
                }
                Err(err)
            }
        }
    }

    async fn pull_model_inner(&self, req: &PullRequest) -> Result<()> {
        let inflight_key = req.inflight_key();
        let (result, shared) = self
            .inflight
            .run(&inflight_key, self.lead_pull(req))
            .await;

        match &result {
            Ok(()) => info!("pull model succeeded (shared={shared})"),
            Err(err) => error!("pull model failed (shared={shared}): {err}"),
        }

        result.map_err(|e| e.context(format!("pull model image: {}", req.reference)))
    }

    /// The winning caller's pull. Runs under the scope lock with its cancel
    /// handle published for deletes to fire.
    async fn lead_pull(&self, req: &PullRequest) -> Result<()> {
        let scope_key = req.scope_key();
        let model_dir = self.model_dir(&req.volume_name, &req.mount_id);
        let status_path = model_dir
            .parent()
            .map(|p| p.join(STATUS_FILE))
            .ok_or_else(|| Error::Internal(format!("no parent for {}", model_dir.display())))?;

        let _scope = self.scopes.lock(&scope_key).await;

        let token = CancellationToken::new();
        let _cancel_handle = self.cancels.register(&scope_key, token.clone());

        // Re-mount with a different reference is not supported.
        if !req.mount_id.is_empty() {
            if let Ok(prev) = self.store.get(&status_path) {
                if !prev.reference.is_empty() && prev.reference != req.reference {
                    return Err(Error::Conflict(format!(
                        "mount_id is re-used for different reference, origin: {}, want: {}",
                        prev.reference, req.reference
                    )));
                }
            }
        }

        // A stale payload would let hard-linked files from a previous pull
        // survive into this one.
        remove_dir_all_tolerant(&model_dir)
            .map_err(|e| e.context("cleanup model directory before pull"))?;

        let writer = StatusWriter {
            store: self.store.clone(),
            path: status_path.clone(),
            volume_name: req.volume_name.clone(),
            mount_id: req.mount_id.clone(),
            reference: req.reference.clone(),
        };

        let hook = Arc::new(ProgressHook::new(self.sink.clone(), {
            let writer = writer.clone();
            Box::new(move |progress| {
                if let Err(err) = writer.write(State::Pulling, progress) {
                    error!("set model status: {err}");
                }
            })
        }));

        let check_quota = self.cfg.features.check_disk_quota
            && req.check_disk_quota
            && !self.model_present_locally(&req.reference);
        let quota = check_quota.then(|| DiskQuotaChecker::new(&self.cfg));

        let puller = ModelPuller::new(
            self.cfg.pull.clone(),
            self.backend.clone(),
            self.keychain.clone(),
            hook.clone(),
            quota,
            self.sink.clone(),
        );

        writer
            .write(State::Pulling, hook.progress())
            .map_err(|e| e.context("set status before pull model"))?;

        let pull = puller.pull(
            &token,
            &req.reference,
            &model_dir,
            req.exclude_model_weights,
            &req.exclude_file_patterns,
        );
        let result = match req.timeout {
            Some(deadline) => match tokio::time::timeout(deadline, pull).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeadlineExceeded(format!(
                    "pull model timed out after {deadline:?}"
                ))),
            },
            None => pull.await,
        };

        match result {
            Ok(()) => {
                writer
                    .write(State::PullSucceeded, hook.progress())
                    .map_err(|e| e.context("set status after pull model succeeded"))?;
                Ok(())
            }
            Err(err) => {
                let state = match &err {
                    Error::Canceled(_) => State::PullCanceled,
                    Error::DeadlineExceeded(_) => State::PullTimeout,
                    _ => State::PullFailed,
                };
                if let Err(status_err) = writer.write(state, hook.progress()) {
                    return Err(err.context(format!("set model status: {status_err}")));
                }
                Err(err)
            }
        }
    }

    /// Delete a model's materialization. Cancels any in-flight pull for
    /// the same scope first, then removes the scoped directory under
    /// retry, tolerating transient "directory not empty" races.
    pub async fn delete_model(&self, volume_name: &str, mount_id: &str) -> Result<()> {
        let start = Instant::now();
        let result = self.delete_model_inner(volume_name, mount_id).await;
        self.sink
            .op_observed("delete_model", start.elapsed(), result.is_ok());
        result
    }

    async fn delete_model_inner(&self, volume_name: &str, mount_id: &str) -> Result<()> {
        let inflight_key = format!("delete-{volume_name}/{mount_id}");
        let scope_key = format!("{volume_name}/{mount_id}");

        if let Some(token) = self.cancels.get(&scope_key) {
            token.cancel();
            info!("canceled pulling request: {scope_key}");
        }

        let scoped_dir = self.scoped_dir(volume_name, mount_id);
        let (result, _shared) = self
            .inflight
            .run(&inflight_key, async {
                let _scope = self.scopes.lock(&scope_key).await;

                with_retry(
                    || {
                        let dir = scoped_dir.clone();
                        async move { remove_dir_all_tolerant(&dir).map_err(RetryError::Error) }
                    },
                    DELETE_RETRY_ATTEMPTS,
                    DELETE_RETRY_DELAY,
                )
                .await
                .map_err(|e| {
                    e.context(format!("retry remove volume dir: {}", scoped_dir.display()))
                })?;

                info!("removed volume dir: {}", scoped_dir.display());
                Ok(())
            })
            .await;
        result
    }

    /// Whether the referenced artifact is already fully materialized in
    /// some volume on this node; if so, quota admission is skipped.
    fn model_present_locally(&self, reference: &str) -> bool {
        let volumes_dir = self.cfg.volumes_dir();
        let entries = match std::fs::read_dir(&volumes_dir) {
            Ok(entries) => entries,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!("read volume dirs from {}: {err}", volumes_dir.display());
                }
                return false;
            }
        };

        let materialized_here = |scoped_dir: &Path| -> bool {
            match self.store.get(&scoped_dir.join(STATUS_FILE)) {
                Ok(status) => {
                    status.reference == reference && scoped_dir.join("model").exists()
                }
                Err(err) => {
                    if !err.is_not_found() {
                        error!("failed to get volume status: {err}");
                    }
                    false
                }
            }
        };

        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let volume_name = entry.file_name().to_string_lossy().into_owned();

            if is_static_volume(&volume_name)
                && materialized_here(&self.cfg.volume_dir(&volume_name))
            {
                return true;
            }

            let models_dir = self.cfg.models_dir(&volume_name);
            let Ok(mounts) = std::fs::read_dir(&models_dir) else {
                continue;
            };
            for mount in mounts.flatten() {
                if !mount.path().is_dir() {
                    continue;
                }
                let mount_id = mount.file_name().to_string_lossy().into_owned();
                if materialized_here(&self.cfg.mount_dir(&volume_name, &mount_id)) {
                    return true;
                }
            }
        }

        false
    }
}

fn remove_dir_all_tolerant(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Internal(format!(
            "remove dir {}: {e}",
            dir.display()
        ))),
    }
}
