//! Per-layer pull progress tracking.
//!
//! The backend drives a [`ProgressHook`] before and after each layer; the
//! hook keeps per-digest records, reports a sorted snapshot through its
//! progress callback on every transition, and answers the slow-layer
//! watchdog's queries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use crate::backend::{ArtifactManifest, LayerDescriptor, PullObserver};
use crate::config::format_bytes;
use crate::error::Error;
use crate::status::{Progress, ProgressItem};
use crate::telemetry::ObservationSink;

/// Callback invoked with a progress snapshot on every layer transition.
pub type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync>;

#[derive(Default)]
struct HookState {
    manifest: Option<ArtifactManifest>,
    items: HashMap<String, ProgressItem>,
}

pub struct ProgressHook {
    state: Mutex<HookState>,
    finished: AtomicU32,
    on_progress: ProgressCallback,
    sink: Arc<dyn ObservationSink>,
}

impl ProgressHook {
    pub fn new(sink: Arc<dyn ObservationSink>, on_progress: ProgressCallback) -> Self {
        Self {
            state: Mutex::new(HookState::default()),
            finished: AtomicU32::new(0),
            on_progress,
            sink,
        }
    }

    fn progress_desc(&self, state: &HookState) -> String {
        let finished = self.finished.load(Ordering::SeqCst);
        match &state.manifest {
            Some(manifest) => format!("{finished}/{}", manifest.layers.len()),
            None => format!("{finished}/unknown"),
        }
    }

    fn snapshot(&self, state: &HookState) -> Progress {
        let mut items: Vec<ProgressItem> = state.items.values().cloned().collect();
        items.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.digest.cmp(&b.digest))
        });

        let total = state
            .manifest
            .as_ref()
            .map(|manifest| {
                manifest
                    .layers
                    .iter()
                    .map(|layer| layer.digest.as_str())
                    .collect::<std::collections::HashSet<_>>()
                    .len()
            })
            .unwrap_or(0);

        Progress { total, items }
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> Progress {
        let state = self.state.lock().unwrap();
        self.snapshot(&state)
    }

    /// Digests of layers that started more than `timeout` ago and have not
    /// finished.
    pub fn stalled_layers(&self, timeout: Duration) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let now = Utc::now();
        state
            .items
            .values()
            .filter(|item| {
                item.finished_at.is_none()
                    && (now - item.started_at).to_std().unwrap_or_default() > timeout
            })
            .map(|item| item.digest.clone())
            .collect()
    }
}

impl PullObserver for ProgressHook {
    fn before_pull_layer(&self, layer: &LayerDescriptor, manifest: &ArtifactManifest) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();

            let path = layer
                .filepath()
                .map(|p| format!("/{p}"))
                .unwrap_or_default();

            state.manifest = Some(manifest.clone());
            state.items.insert(
                layer.digest.clone(),
                ProgressItem {
                    digest: layer.digest.clone(),
                    path,
                    size: layer.size,
                    started_at: Utc::now(),
                    finished_at: None,
                    error: None,
                },
            );
            self.snapshot(&state)
        };
        // The callback may take other locks; the state lock is released.
        (self.on_progress)(snapshot);
    }

    fn after_pull_layer(&self, layer: &LayerDescriptor, error: Option<&Error>) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let desc = self.progress_desc(&state);

            let Some(item) = state.items.get_mut(&layer.digest) else {
                return;
            };

            let elapsed = (Utc::now() - item.started_at).to_std().unwrap_or_default();
            self.sink
                .pull_observed("pull_layer", item.size, elapsed, error.is_none());

            match error {
                Some(err) => {
                    error!(
                        "failed to pull layer: {}{} ({desc}): {err}",
                        item.digest, item.path
                    );
                    item.error = Some(err.to_string());
                }
                None => {
                    item.finished_at = Some(Utc::now());
                    self.finished.fetch_add(1, Ordering::SeqCst);
                    info!(
                        "pulled layer: {} {} {} {} ({desc}) {elapsed:?}",
                        layer.media_type,
                        item.digest,
                        item.path,
                        format_bytes(item.size)
                    );
                }
            }

            self.snapshot(&state)
        };
        (self.on_progress)(snapshot);
    }
}
