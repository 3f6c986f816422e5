//! High-level facade wiring the driver together.
//!
//! Embedders construct a [`ModelVolumeService`] from a [`Config`] plus the
//! external collaborators (pull backend, registry keychain, mounter,
//! observation sink) and get the full node-side surface: volume
//! create/delete, publish/unpublish, dynamic mount lookups, startup
//! recovery, and the periodic cache scanner.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::{PullBackend, RegistryKeychain};
use crate::cache::CacheScanner;
use crate::config::Config;
use crate::dynserver::DynamicServerManager;
use crate::error::Result;
use crate::mount::Mounter;
use crate::status::{Status, StatusStore};
use crate::telemetry::ObservationSink;
use crate::volume::{Provisioner, Publisher};
use crate::worker::Worker;

pub struct ModelVolumeService {
    cfg: Arc<Config>,
    store: Arc<StatusStore>,
    provisioner: Arc<Provisioner>,
    publisher: Publisher,
    servers: Arc<DynamicServerManager>,
    scanner: Arc<CacheScanner>,
}

impl ModelVolumeService {
    pub fn new(
        cfg: Config,
        backend: Arc<dyn PullBackend>,
        keychain: Arc<dyn RegistryKeychain>,
        mounter: Arc<dyn Mounter>,
        sink: Arc<dyn ObservationSink>,
    ) -> Result<Self> {
        cfg.validate()?;
        let cfg = Arc::new(cfg);

        let store = Arc::new(StatusStore::new());
        let worker = Arc::new(Worker::new(
            cfg.clone(),
            store.clone(),
            backend,
            keychain,
            sink.clone(),
        ));
        let provisioner = Arc::new(Provisioner::new(cfg.clone(), store.clone(), worker.clone()));
        let servers = Arc::new(DynamicServerManager::new(cfg.clone(), provisioner.clone()));
        let publisher = Publisher::new(
            cfg.clone(),
            store.clone(),
            worker,
            mounter,
            servers.clone(),
            sink.clone(),
        );
        let scanner = Arc::new(CacheScanner::new(cfg.clone(), store.clone(), sink));

        Ok(Self {
            cfg,
            store,
            provisioner,
            publisher,
            servers,
            scanner,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn status_store(&self) -> &Arc<StatusStore> {
        &self.store
    }

    /// Re-bind dynamic control servers from the on-disk volume tree. Call
    /// once on process start.
    pub async fn recover(&self) -> Result<()> {
        self.servers.recover().await
    }

    /// Start the periodic cache scanner; cancel `token` to stop it.
    pub fn start_cache_scanner(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.scanner.clone().spawn(token)
    }

    /// Stop every dynamic control server.
    pub fn shutdown(&self) {
        self.servers.close_all();
    }

    // Provisioning surface.

    pub async fn create_volume(
        &self,
        volume_name: &str,
        parameters: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.provisioner
            .create_volume(volume_name, parameters, timeout)
            .await
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.provisioner.delete_volume(volume_id).await
    }

    pub async fn create_mount(
        &self,
        volume_name: &str,
        req: &crate::api::MountRequest,
    ) -> Result<Status> {
        self.provisioner.create_mount(volume_name, req).await
    }

    pub fn get_dynamic_mount(&self, volume_name: &str, mount_id: &str) -> Result<Status> {
        self.provisioner.get_dynamic_mount(volume_name, mount_id)
    }

    pub fn list_dynamic_mounts(&self, volume_name: &str) -> Result<Vec<Status>> {
        self.provisioner.list_dynamic_mounts(volume_name)
    }

    pub fn list_volumes(&self) -> Result<Vec<Status>> {
        self.provisioner.list_volumes()
    }

    // Publishing surface.

    pub async fn publish(
        &self,
        volume_name: &str,
        target_path: &Path,
        volume_context: &HashMap<String, String>,
    ) -> Result<()> {
        self.publisher
            .publish(volume_name, target_path, volume_context)
            .await
    }

    pub async fn unpublish(&self, volume_name: &str, target_path: &Path) -> Result<()> {
        self.publisher.unpublish(volume_name, target_path).await
    }
}
