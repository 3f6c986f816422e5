//! Driver configuration and on-disk directory layout.
//!
//! The layout rooted at `root_dir` is the persistent state of record:
//!
//! ```text
//! <root>/volumes/<volume>/status.json               static, inline, dynamic root
//! <root>/volumes/<volume>/model/                    static payload
//! <root>/volumes/<volume>/models/<mount>/status.json
//! <root>/volumes/<volume>/models/<mount>/model/     dynamic payload
//! <root>/volumes/<volume>/csi/csi.sock              dynamic control socket
//! ```
//!
//! Parameter keys for the outer dispatcher are namespaced under
//! `service_name` (e.g. `<service_name>/reference`).

mod size;

pub use size::{format_bytes, parse_size, Size, SizeParseError};

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// File name of the per-volume / per-mount status document.
pub const STATUS_FILE: &str = "status.json";

/// Pull-backend tuning knobs.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Number of layers fetched concurrently.
    pub concurrency: usize,
    /// Optional HTTP proxy for registry traffic.
    pub proxy_url: Option<String>,
    /// Optional P2P acceleration endpoint handed to the backend.
    pub acceleration_endpoint: Option<String>,
    /// Directory holding registry credentials, consumed by the backend.
    pub docker_config_dir: Option<PathBuf>,
    /// A layer still unfinished after this many seconds is reported as
    /// slow. Zero disables the watchdog.
    pub pull_layer_timeout_in_seconds: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            proxy_url: None,
            acceleration_endpoint: None,
            docker_config_dir: None,
            pull_layer_timeout_in_seconds: 0,
        }
    }
}

/// Feature toggles.
#[derive(Debug, Clone, Default)]
pub struct Features {
    /// Master switch for disk-quota admission.
    pub check_disk_quota: bool,
    /// Quota budget for `root_dir`. Zero means "whatever the filesystem
    /// reports as available".
    pub disk_usage_limit: Size,
}

/// Driver configuration.
///
/// Constructed explicitly by the embedder; this crate performs no config
/// file parsing.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace for dispatcher parameter keys. Required.
    pub service_name: String,
    /// Root of the on-disk volume tree. Required.
    pub root_dir: PathBuf,
    /// Identity reported to the orchestrator.
    pub node_id: String,
    /// Endpoint of the orchestrator-facing RPC surface (dispatcher-owned).
    pub csi_endpoint: String,
    /// Endpoint of the out-of-cluster RPC surface (dispatcher-owned).
    pub external_csi_endpoint: String,
    /// Endpoint of the node-wide dynamic HTTP surface (dispatcher-owned).
    pub dynamic_csi_endpoint: String,
    /// Metrics listen address (export is owned by the embedder).
    pub metrics_addr: String,
    /// Trace collector endpoint (export is owned by the embedder).
    pub trace_endpoint: String,
    /// pprof-style debug listen address (owned by the embedder).
    pub pprof_addr: String,
    pub pull: PullConfig,
    pub features: Features,
    /// Cache scanner period.
    pub scan_interval: Duration,
}

impl Config {
    /// Create a configuration with the required fields and defaults for
    /// everything else.
    pub fn new(service_name: impl Into<String>, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_name: service_name.into(),
            root_dir: root_dir.into(),
            node_id: String::new(),
            csi_endpoint: String::new(),
            external_csi_endpoint: String::new(),
            dynamic_csi_endpoint: String::new(),
            metrics_addr: String::new(),
            trace_endpoint: String::new(),
            pprof_addr: String::new(),
            pull: PullConfig::default(),
            features: Features::default(),
            scan_interval: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::InvalidArgument("service_name is required".into()));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("root_dir is required".into()));
        }
        Ok(())
    }

    // Parameter keys of the outer dispatcher, namespaced by service name.

    pub fn parameter_key_type(&self) -> String {
        format!("{}/type", self.service_name)
    }

    pub fn parameter_key_reference(&self) -> String {
        format!("{}/reference", self.service_name)
    }

    pub fn parameter_key_mount_id(&self) -> String {
        format!("{}/mount-id", self.service_name)
    }

    pub fn parameter_key_check_disk_quota(&self) -> String {
        format!("{}/check-disk-quota", self.service_name)
    }

    // Directory layout.

    /// `<root>/volumes`
    pub fn volumes_dir(&self) -> PathBuf {
        self.root_dir.join("volumes")
    }

    /// `<root>/volumes/<volume>`
    pub fn volume_dir(&self, volume_name: &str) -> PathBuf {
        self.volumes_dir().join(volume_name)
    }

    /// `<root>/volumes/<volume>/status.json`
    pub fn volume_status_path(&self, volume_name: &str) -> PathBuf {
        self.volume_dir(volume_name).join(STATUS_FILE)
    }

    /// `<root>/volumes/<volume>/model`
    pub fn model_dir(&self, volume_name: &str) -> PathBuf {
        self.volume_dir(volume_name).join("model")
    }

    /// `<root>/volumes/<volume>/models`
    pub fn models_dir(&self, volume_name: &str) -> PathBuf {
        self.volume_dir(volume_name).join("models")
    }

    /// `<root>/volumes/<volume>/models/<mount>`
    pub fn mount_dir(&self, volume_name: &str, mount_id: &str) -> PathBuf {
        self.models_dir(volume_name).join(mount_id)
    }

    /// `<root>/volumes/<volume>/models/<mount>/status.json`
    pub fn mount_status_path(&self, volume_name: &str, mount_id: &str) -> PathBuf {
        self.mount_dir(volume_name, mount_id).join(STATUS_FILE)
    }

    /// `<root>/volumes/<volume>/models/<mount>/model`
    pub fn mount_model_dir(&self, volume_name: &str, mount_id: &str) -> PathBuf {
        self.mount_dir(volume_name, mount_id).join("model")
    }

    /// `<root>/volumes/<volume>/csi`
    pub fn csi_sock_dir(&self, volume_name: &str) -> PathBuf {
        self.volume_dir(volume_name).join("csi")
    }

    /// `<root>/volumes/<volume>/csi/csi.sock`
    pub fn csi_sock_path(&self, volume_name: &str) -> PathBuf {
        self.csi_sock_dir(volume_name).join("csi.sock")
    }

    /// Layer timeout as a [`Duration`], `None` when disabled.
    pub fn pull_layer_timeout(&self) -> Option<Duration> {
        (self.pull.pull_layer_timeout_in_seconds > 0)
            .then(|| Duration::from_secs(self.pull.pull_layer_timeout_in_seconds))
    }
}
