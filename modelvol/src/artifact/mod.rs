//! Inspected model artifact with cached layer metadata.
//!
//! Wraps the pull backend's inspect call, retrying transient failures and
//! caching the result for the lifetime of the value. Exposes the two
//! derived views the driver needs: a dedup-aware byte size for quota
//! admission and the list of layer file paths for weight-excluded fetches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::{
    InspectOptions, InspectedArtifact, InspectedLayer, PullBackend, SAFETENSORS_INDEX_FILE,
    WEIGHT_MEDIA_TYPE_PREFIX,
};
use crate::error::{Error, Result};

const INSPECT_ATTEMPTS: u32 = 3;
const INSPECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// A model-weight layer: a weight media type, a `*.safetensors` shard, or
/// the safetensors index sidecar.
fn is_weight_layer(layer: &InspectedLayer) -> bool {
    if layer.media_type.starts_with(WEIGHT_MEDIA_TYPE_PREFIX) {
        return true;
    }
    if layer.filepath.ends_with(".safetensors") {
        return true;
    }
    layer.filepath == SAFETENSORS_INDEX_FILE
}

pub struct ModelArtifact {
    pub reference: String,

    backend: Arc<dyn PullBackend>,
    plain_http: bool,
    inspected: tokio::sync::Mutex<Option<Arc<InspectedArtifact>>>,
}

impl ModelArtifact {
    pub fn new(backend: Arc<dyn PullBackend>, reference: impl Into<String>, plain_http: bool) -> Self {
        Self {
            reference: reference.into(),
            backend,
            plain_http,
            inspected: tokio::sync::Mutex::new(None),
        }
    }

    async fn inspect(&self) -> Result<Arc<InspectedArtifact>> {
        let mut slot = self.inspected.lock().await;
        if let Some(artifact) = slot.as_ref() {
            return Ok(artifact.clone());
        }

        let opts = InspectOptions {
            plain_http: self.plain_http,
        };
        let start = std::time::Instant::now();
        let mut last_err = None;
        for attempt in 0..INSPECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(INSPECT_RETRY_DELAY).await;
            }
            match self.backend.inspect(&self.reference, &opts).await {
                Ok(artifact) => {
                    info!(
                        "inspected model {}, duration: {:?}",
                        self.reference,
                        start.elapsed()
                    );
                    let artifact = Arc::new(artifact);
                    *slot = Some(artifact.clone());
                    return Ok(artifact);
                }
                Err(err) => {
                    warn!(
                        "inspect model {} (attempt {}/{}): {err}",
                        self.reference,
                        attempt + 1,
                        INSPECT_ATTEMPTS
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| Error::Internal("inspect produced no result".into()))
            .context(format!("inspect model: {}", self.reference)))
    }

    fn filtered_layers(
        artifact: &InspectedArtifact,
        exclude_weights: bool,
    ) -> Vec<InspectedLayer> {
        artifact
            .layers
            .iter()
            .filter(|layer| {
                if !exclude_weights {
                    return true;
                }
                if layer.filepath.is_empty() {
                    warn!("layer {} has no file path, skip", layer.digest);
                    return false;
                }
                !is_weight_layer(layer)
            })
            .cloned()
            .collect()
    }

    /// Total artifact size in bytes, counting each distinct layer digest
    /// once.
    pub async fn size(&self, exclude_weights: bool) -> Result<u64> {
        let artifact = self.inspect().await?;

        let mut seen = HashSet::new();
        Ok(Self::filtered_layers(&artifact, exclude_weights)
            .into_iter()
            .filter(|layer| seen.insert(layer.digest.clone()))
            .map(|layer| layer.size)
            .sum())
    }

    /// Layer file paths in artifact order. With `exclude_weights`, layers
    /// without a path and weight layers are dropped.
    pub async fn patterns(&self, exclude_weights: bool) -> Result<Vec<String>> {
        let artifact = self.inspect().await?;

        Ok(Self::filtered_layers(&artifact, exclude_weights)
            .into_iter()
            .map(|layer| layer.filepath)
            .collect())
    }
}
