//! Observation seam.
//!
//! The driver reports what happened (operation outcomes, per-layer pull
//! timings, cache usage, and the set of materialized mounts) through an
//! [`ObservationSink`]. Exporting those observations is the embedder's
//! concern; the default sink drops everything.

use std::fmt;
use std::time::Duration;

use crate::config::format_bytes;

/// Kind of a materialized mount, as seen by the cache scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Static volume (`pvc-` prefixed).
    Pvc,
    /// Inline volume: a status document but no `models/` tree.
    Inline,
    /// A mount under a dynamic root volume.
    Dynamic,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Pvc => write!(f, "pvc"),
            MountKind::Inline => write!(f, "inline"),
            MountKind::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// One materialized mount in the scanner snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountItem {
    pub reference: String,
    pub kind: MountKind,
    pub volume_name: String,
    pub mount_id: String,
}

/// Receiver for driver observations.
///
/// All methods have no-op defaults; implementors override what they
/// export. The mount-item list is always replaced wholesale so a sink
/// never races a delete against a reset.
pub trait ObservationSink: Send + Sync {
    /// A top-level operation finished.
    fn op_observed(&self, _op: &str, _duration: Duration, _ok: bool) {}

    /// A pull suboperation moved `size_in_bytes` (see [`size_label`] for
    /// the bucketing convention).
    fn pull_observed(&self, _op: &str, _size_in_bytes: u64, _duration: Duration, _ok: bool) {}

    /// A layer exceeded the configured pull timeout without finishing.
    fn pull_layer_stalled(&self, _digest: &str) {}

    /// Bytes used under the driver root, from the periodic scan.
    fn cache_used_bytes(&self, _bytes: u64) {}

    /// Full snapshot of materialized mounts.
    fn mount_items(&self, _items: Vec<MountItem>) {}
}

/// Sink that ignores every observation.
#[derive(Default)]
pub struct NoopSink;

impl ObservationSink for NoopSink {}

/// Power-of-two size buckets from 1 MiB to 8 TiB.
const SIZE_BUCKET_COUNT: u32 = 24;

/// Bucket label for a byte size.
///
/// Sizes are assigned to the smallest power-of-two MiB bucket that holds
/// them; anything above the largest bucket (8 TiB) is `+Inf`.
pub fn size_label(size_in_bytes: u64) -> String {
    let size_in_mib = size_in_bytes as f64 / (1024.0 * 1024.0);
    for exp in 0..SIZE_BUCKET_COUNT {
        let bucket_mib = (1u64 << exp) as f64;
        if size_in_mib <= bucket_mib {
            return format_bytes((1u64 << exp) * 1024 * 1024);
        }
    }
    "+Inf".to_string()
}
