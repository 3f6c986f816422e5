//! Shared fixtures: an in-memory pull backend, a fake mounter, and a
//! recording observation sink, so the suite runs unprivileged and offline.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use modelvol::backend::{
    ArtifactManifest, FetchOptions, InspectOptions, InspectedArtifact, InspectedLayer,
    LayerDescriptor, PullBackend, PullOptions, Scheme, StaticKeychain, ANNOTATION_FILEPATH,
};
use modelvol::config::Config;
use modelvol::error::{Error, Result};
use modelvol::mount::{MountSpec, Mounter};
use modelvol::service::ModelVolumeService;
use modelvol::telemetry::NoopSink;

pub const MODEL_REFERENCE: &str = "example.com/model:10mb";

/// One synthetic layer served by [`FakeBackend`].
#[derive(Clone)]
pub struct FakeLayer {
    pub digest: String,
    pub filepath: String,
    pub size: u64,
    pub media_type: String,
}

impl FakeLayer {
    pub fn weight(digest: &str, filepath: &str, size: u64) -> Self {
        Self {
            digest: digest.into(),
            filepath: filepath.into(),
            size,
            media_type: "application/vnd.cnai.model.weight.v1.tar".into(),
        }
    }

    pub fn doc(digest: &str, filepath: &str, size: u64) -> Self {
        Self {
            digest: digest.into(),
            filepath: filepath.into(),
            size,
            media_type: "application/vnd.cnai.model.doc.v1.tar".into(),
        }
    }

    fn descriptor(&self) -> LayerDescriptor {
        let mut annotations = HashMap::new();
        annotations.insert(ANNOTATION_FILEPATH.to_string(), self.filepath.clone());
        LayerDescriptor {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            annotations,
        }
    }

    fn inspected(&self) -> InspectedLayer {
        InspectedLayer {
            media_type: self.media_type.clone(),
            digest: self.digest.clone(),
            size: self.size,
            filepath: self.filepath.clone(),
        }
    }
}

/// The default three-layer model behind [`MODEL_REFERENCE`].
pub fn default_layers() -> Vec<FakeLayer> {
    vec![
        FakeLayer::weight("sha256:weights", "model-1.safetensor", 10 * 1024 * 1024),
        FakeLayer::doc("sha256:config", "config.json", 512),
        FakeLayer::doc("sha256:readme", "README.md", 256),
    ]
}

/// Pull backend that writes small files locally, honoring an optional
/// per-pull delay so tests can race cancellation against it.
pub struct FakeBackend {
    pub layers: Vec<FakeLayer>,
    pub delay: Duration,
    pub pulls: AtomicUsize,
    pub fetches: AtomicUsize,
    pub inspects: AtomicUsize,
    pub fail_pulls_with: Mutex<Option<Error>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_layers(default_layers())
    }

    pub fn with_layers(layers: Vec<FakeLayer>) -> Self {
        Self {
            layers,
            delay: Duration::ZERO,
            pulls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            inspects: AtomicUsize::new(0),
            fail_pulls_with: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_with(self, err: Error) -> Self {
        *self.fail_pulls_with.lock().unwrap() = Some(err);
        self
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst) + self.fetches.load(Ordering::SeqCst)
    }

    fn write_layer(dir: &Path, layer: &FakeLayer) -> Result<()> {
        let path = dir.join(&layer.filepath);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, layer.digest.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl PullBackend for FakeBackend {
    async fn inspect(&self, _reference: &str, _opts: &InspectOptions) -> Result<InspectedArtifact> {
        self.inspects.fetch_add(1, Ordering::SeqCst);
        Ok(InspectedArtifact {
            layers: self.layers.iter().map(FakeLayer::inspected).collect(),
        })
    }

    async fn pull(&self, _reference: &str, opts: PullOptions) -> Result<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = self.fail_pulls_with.lock().unwrap().clone() {
            return Err(err);
        }

        let manifest = ArtifactManifest {
            layers: self.layers.iter().map(FakeLayer::descriptor).collect(),
        };
        for layer in &self.layers {
            let desc = layer.descriptor();
            opts.observer.before_pull_layer(&desc, &manifest);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let result = Self::write_layer(&opts.extract_dir, layer);
            opts.observer.after_pull_layer(&desc, result.as_ref().err());
            result?;
        }
        Ok(())
    }

    async fn fetch(&self, _reference: &str, opts: FetchOptions) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for layer in &self.layers {
            if opts.patterns.iter().any(|p| p == &layer.filepath) {
                Self::write_layer(&opts.output, layer)?;
            }
        }
        Ok(())
    }
}

/// Mounter that tracks mount points in memory instead of touching the
/// kernel mount table.
#[derive(Default)]
pub struct FakeMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    pub mount_calls: AtomicUsize,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mounted_at(&self, target: &Path) -> bool {
        self.mounted.lock().unwrap().contains(target)
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(&self, spec: MountSpec) -> Result<()> {
        let target = spec.target().to_path_buf();
        spec.build()?;
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        self.mounted.lock().unwrap().insert(target);
        Ok(())
    }

    async fn unmount(&self, target: &Path, _lazy: bool) -> Result<()> {
        // "Not mounted" is success, as with the real tool.
        self.mounted.lock().unwrap().remove(target);
        Ok(())
    }

    async fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(self.mounted.lock().unwrap().contains(target))
    }

    async fn ensure_mount_point(&self, target: &Path) -> Result<()> {
        std::fs::create_dir_all(target)?;
        Ok(())
    }
}

/// A service over fakes, rooted at a temp directory.
pub struct TestDriver {
    pub service: ModelVolumeService,
    pub backend: Arc<FakeBackend>,
    pub mounter: Arc<FakeMounter>,
    pub cfg: Config,
}

pub fn driver(root: &Path, backend: FakeBackend) -> TestDriver {
    driver_with_config(Config::new("model.csi.example.com", root), backend)
}

pub fn driver_with_config(cfg: Config, backend: FakeBackend) -> TestDriver {
    let backend = Arc::new(backend);
    let mounter = Arc::new(FakeMounter::new());
    let service = ModelVolumeService::new(
        cfg.clone(),
        backend.clone(),
        Arc::new(StaticKeychain::new(Scheme::Https)),
        mounter.clone(),
        Arc::new(NoopSink),
    )
    .expect("construct service");
    TestDriver {
        service,
        backend,
        mounter,
        cfg,
    }
}

/// Dispatcher-style parameters for a static create.
pub fn image_params(cfg: &Config, reference: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert(cfg.parameter_key_type(), "image".to_string());
    params.insert(cfg.parameter_key_reference(), reference.to_string());
    params
}
