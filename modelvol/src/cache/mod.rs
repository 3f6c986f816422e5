//! Periodic cache scan.
//!
//! Every `scan_interval` the scanner walks the driver root, aggregates
//! used bytes from block counts, classifies every materialized mount
//! (pvc / inline / dynamic), and hands the whole snapshot to the
//! observation sink in one assignment.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Result;
use crate::quota;
use crate::status::StatusStore;
use crate::telemetry::{MountItem, MountKind, ObservationSink};
use crate::volume::is_static_volume;

pub struct CacheScanner {
    cfg: Arc<Config>,
    store: Arc<StatusStore>,
    sink: Arc<dyn ObservationSink>,
}

impl CacheScanner {
    pub fn new(cfg: Arc<Config>, store: Arc<StatusStore>, sink: Arc<dyn ObservationSink>) -> Self {
        Self { cfg, store, sink }
    }

    /// One scan pass: usage gauge plus the mount-item snapshot.
    pub fn scan(&self) -> Result<()> {
        let used = quota::used_size(&self.cfg.root_dir)?;
        self.sink.cache_used_bytes(used);

        let items = self.collect_mount_items()?;
        debug!("cache scan: {} bytes used, {} mounts", used, items.len());
        self.sink.mount_items(items);

        Ok(())
    }

    fn collect_mount_items(&self) -> Result<Vec<MountItem>> {
        let volumes_dir = self.cfg.volumes_dir();
        let entries = match std::fs::read_dir(&volumes_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(crate::error::Error::Internal(format!(
                    "read volume dirs from {}: {e}",
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

        let mut items = Vec::new();
        for volume_name in volume_names {
            if is_static_volume(&volume_name) {
                if let Ok(status) = self.store.get(&self.cfg.volume_status_path(&volume_name)) {
                    items.push(MountItem {
                        reference: status.reference,
                        kind: MountKind::Pvc,
                        volume_name,
                        mount_id: String::new(),
                    });
                }
                continue;
            }

            let models_dir = self.cfg.models_dir(&volume_name);
            match std::fs::read_dir(&models_dir) {
                Ok(mounts) => {
                    let mut mount_ids: Vec<String> = mounts
                        .flatten()
                        .filter(|entry| entry.path().is_dir())
                        .map(|entry| entry.file_name().to_string_lossy().into_owned())
                        .collect();
                    mount_ids.sort();

                    for mount_id in mount_ids {
                        if let Ok(status) = self
                            .store
                            .get(&self.cfg.mount_status_path(&volume_name, &mount_id))
                        {
                            items.push(MountItem {
                                reference: status.reference,
                                kind: MountKind::Dynamic,
                                volume_name: volume_name.clone(),
                                mount_id,
                            });
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // No models tree: an inline volume, if it has a status.
                    if let Ok(status) = self.store.get(&self.cfg.volume_status_path(&volume_name)) {
                        items.push(MountItem {
                            reference: status.reference,
                            kind: MountKind::Inline,
                            volume_name,
                            mount_id: String::new(),
                        });
                    }
                }
                Err(e) => {
                    warn!("read model dirs from {}: {e}", models_dir.display());
                }
            }
        }

        Ok(items)
    }

    /// Scan on a fixed period until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let period = self.cfg.scan_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        if let Err(err) = self.scan() {
                            if !err.is_not_found() {
                                warn!("scan cache failed: {err}");
                            }
                        }
                    }
                }
            }
        })
    }
}
