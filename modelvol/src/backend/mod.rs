//! External pull-backend interface.
//!
//! The driver never talks to an OCI registry itself; it drives an injected
//! [`PullBackend`] that knows how to inspect a model artifact, pull and
//! extract all of its layers, or fetch a subset of files by path. The
//! backend reports per-layer lifecycle through a [`PullObserver`].
//!
//! Registry credentials are likewise external: a [`RegistryKeychain`]
//! answers only the question this crate needs, which URL scheme to use
//! for a given reference.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Layer annotation carrying the file path a layer materializes to.
pub const ANNOTATION_FILEPATH: &str = "org.cnai.model.filepath";

/// Media-type prefix shared by model-weight layer variants.
pub const WEIGHT_MEDIA_TYPE_PREFIX: &str = "application/vnd.cnai.model.weight.";

/// Sidecar index that accompanies sharded safetensors weights.
pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

/// One layer blob as described by the artifact manifest.
#[derive(Debug, Clone, Default)]
pub struct LayerDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    pub annotations: HashMap<String, String>,
}

impl LayerDescriptor {
    /// File path annotation, if present and non-empty.
    pub fn filepath(&self) -> Option<&str> {
        self.annotations
            .get(ANNOTATION_FILEPATH)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }
}

/// The artifact manifest, as handed to observers for progress totals.
#[derive(Debug, Clone, Default)]
pub struct ArtifactManifest {
    pub layers: Vec<LayerDescriptor>,
}

/// Result of inspecting an artifact without downloading it.
#[derive(Debug, Clone, Default)]
pub struct InspectedArtifact {
    pub layers: Vec<InspectedLayer>,
}

/// One layer as reported by inspect.
#[derive(Debug, Clone, Default)]
pub struct InspectedLayer {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    pub filepath: String,
}

#[derive(Debug, Clone, Default)]
pub struct InspectOptions {
    pub plain_http: bool,
}

/// Options for a full pull-and-extract.
pub struct PullOptions {
    pub extract_dir: PathBuf,
    pub concurrency: usize,
    pub plain_http: bool,
    pub proxy: Option<String>,
    pub acceleration_endpoint: Option<String>,
    /// Invoked before and after each layer.
    pub observer: Arc<dyn PullObserver>,
}

/// Options for a path-restricted fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub output: PathBuf,
    /// File paths to download; everything else is skipped.
    pub patterns: Vec<String>,
    pub concurrency: usize,
    pub plain_http: bool,
    pub proxy: Option<String>,
}

/// Per-layer lifecycle callbacks during a pull.
pub trait PullObserver: Send + Sync {
    fn before_pull_layer(&self, layer: &LayerDescriptor, manifest: &ArtifactManifest);
    fn after_pull_layer(&self, layer: &LayerDescriptor, error: Option<&crate::error::Error>);
}

/// The OCI pull backend consumed by the core.
#[async_trait]
pub trait PullBackend: Send + Sync {
    /// Fetch the artifact manifest and describe its layers.
    async fn inspect(&self, reference: &str, opts: &InspectOptions) -> Result<InspectedArtifact>;

    /// Pull every layer and extract into `opts.extract_dir`.
    async fn pull(&self, reference: &str, opts: PullOptions) -> Result<()>;

    /// Download only the files matching `opts.patterns` into `opts.output`.
    async fn fetch(&self, reference: &str, opts: FetchOptions) -> Result<()>;
}

/// URL scheme for reaching a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

/// Resolves the registry scheme for a reference.
///
/// Credential file loading lives outside this crate; the core only needs
/// to know whether to speak plain HTTP.
pub trait RegistryKeychain: Send + Sync {
    fn scheme(&self, reference: &str) -> Scheme;
}

/// Keychain that answers the same scheme for every reference.
pub struct StaticKeychain {
    scheme: Scheme,
}

impl StaticKeychain {
    pub fn new(scheme: Scheme) -> Self {
        Self { scheme }
    }

    pub fn https() -> Self {
        Self::new(Scheme::Https)
    }
}

impl RegistryKeychain for StaticKeychain {
    fn scheme(&self, _reference: &str) -> Scheme {
        self.scheme
    }
}
