//! Pull orchestration.
//!
//! [`ModelPuller`] turns one pull request into backend calls: resolve the
//! registry scheme, admit against the disk quota, then either pull the
//! whole artifact or fetch only the non-weight files, optionally applying
//! the user's exclusion patterns afterwards.

pub mod hook;
pub mod patterns;

pub use hook::{ProgressCallback, ProgressHook};
pub use patterns::{filter_files, FilePatternMatcher};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifact::ModelArtifact;
use crate::backend::{FetchOptions, PullBackend, PullOptions, RegistryKeychain, Scheme};
use crate::config::PullConfig;
use crate::error::{Error, Result};
use crate::quota::DiskQuotaChecker;
use crate::telemetry::ObservationSink;

const WATCHDOG_PERIOD: Duration = Duration::from_secs(30);

pub struct ModelPuller {
    pull_cfg: PullConfig,
    backend: Arc<dyn PullBackend>,
    keychain: Arc<dyn RegistryKeychain>,
    hook: Arc<ProgressHook>,
    quota: Option<DiskQuotaChecker>,
    sink: Arc<dyn ObservationSink>,
}

impl ModelPuller {
    pub fn new(
        pull_cfg: PullConfig,
        backend: Arc<dyn PullBackend>,
        keychain: Arc<dyn RegistryKeychain>,
        hook: Arc<ProgressHook>,
        quota: Option<DiskQuotaChecker>,
        sink: Arc<dyn ObservationSink>,
    ) -> Self {
        Self {
            pull_cfg,
            backend,
            keychain,
            hook,
            quota,
            sink,
        }
    }

    /// Materialize `reference` into `target_dir`.
    ///
    /// Cancelling `token` aborts the backend call and surfaces
    /// [`Error::Canceled`].
    pub async fn pull(
        &self,
        token: &CancellationToken,
        reference: &str,
        target_dir: &Path,
        exclude_weights: bool,
        exclude_file_patterns: &[String],
    ) -> Result<()> {
        // Compile (and thereby validate) user patterns before any network
        // or filesystem work.
        let matcher = if exclude_file_patterns.is_empty() {
            None
        } else {
            Some(FilePatternMatcher::new(exclude_file_patterns)?)
        };

        let plain_http = self.keychain.scheme(reference) == Scheme::Http;
        let artifact = ModelArtifact::new(self.backend.clone(), reference, plain_http);

        if let Some(quota) = &self.quota {
            quota
                .admit(&artifact, exclude_weights)
                .await
                .map_err(|e| e.context("check disk quota"))?;
        }

        std::fs::create_dir_all(target_dir)
            .map_err(|e| Error::Internal(format!("create model dir {}: {e}", target_dir.display())))?;

        if !exclude_weights {
            let _watchdog = self.spawn_watchdog(token);

            let opts = PullOptions {
                extract_dir: target_dir.to_path_buf(),
                concurrency: self.pull_cfg.concurrency,
                plain_http,
                proxy: self.pull_cfg.proxy_url.clone(),
                acceleration_endpoint: self.pull_cfg.acceleration_endpoint.clone(),
                observer: self.hook.clone(),
            };

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(Error::Canceled(format!("pull model canceled: {reference}")));
                }
                result = self.backend.pull(reference, opts) => {
                    result.map_err(|e| e.context("pull model image"))?;
                }
            }
            return Ok(());
        }

        let patterns = artifact
            .patterns(true)
            .await
            .map_err(|e| e.context("get model file patterns without weights"))?;

        info!(
            "fetching model without weights: {reference}, file patterns: {}",
            patterns.join(", ")
        );

        let opts = FetchOptions {
            output: target_dir.to_path_buf(),
            patterns,
            concurrency: self.pull_cfg.concurrency,
            plain_http,
            proxy: self.pull_cfg.proxy_url.clone(),
        };

        tokio::select! {
            _ = token.cancelled() => {
                return Err(Error::Canceled(format!("fetch model canceled: {reference}")));
            }
            result = self.backend.fetch(reference, opts) => {
                result.map_err(|e| e.context("fetch model"))?;
            }
        }

        if let Some(matcher) = &matcher {
            if matcher.excludes() {
                filter_files(target_dir, matcher)
                    .map_err(|e| e.context("apply exclude file patterns"))?;
            }
        }

        Ok(())
    }

    /// Watch for layers that outlive the configured timeout, reporting
    /// each one exactly once. The returned guard stops the watcher.
    fn spawn_watchdog(
        &self,
        token: &CancellationToken,
    ) -> Option<tokio_util::sync::DropGuard> {
        let timeout = (self.pull_cfg.pull_layer_timeout_in_seconds > 0)
            .then(|| Duration::from_secs(self.pull_cfg.pull_layer_timeout_in_seconds))?;

        let hook = self.hook.clone();
        let sink = self.sink.clone();
        let watch_token = token.child_token();
        let task_token = watch_token.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_PERIOD);
            interval.tick().await; // the first tick fires immediately
            let mut reported: HashSet<String> = HashSet::new();
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => return,
                    _ = interval.tick() => {
                        for digest in hook.stalled_layers(timeout) {
                            if reported.insert(digest.clone()) {
                                warn!("pulling layer {digest} is taking too long");
                                sink.pull_layer_stalled(&digest);
                            }
                        }
                    }
                }
            }
        });

        Some(watch_token.drop_guard())
    }
}
