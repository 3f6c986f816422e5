//! Volume orchestration: classification, provisioning, publishing.

mod provisioner;
mod publisher;

pub use provisioner::Provisioner;
pub use publisher::Publisher;

/// Name prefix of static volumes.
pub const STATIC_VOLUME_PREFIX: &str = "pvc-";
/// Name prefix of dynamic root volumes.
pub const DYNAMIC_VOLUME_PREFIX: &str = "csi-";

pub fn is_static_volume(volume_name: &str) -> bool {
    volume_name.starts_with(STATIC_VOLUME_PREFIX)
}

pub fn is_dynamic_volume(volume_name: &str) -> bool {
    volume_name.starts_with(DYNAMIC_VOLUME_PREFIX)
}

/// The three publish-time shapes of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    /// One model, provisioned ahead of publish (`pvc-` names).
    Static,
    /// One model, referenced in the publish-time volume context.
    StaticInline,
    /// A root hosting many independently pulled mounts.
    DynamicRoot,
}

/// Classify a volume at publish time.
///
/// The naming convention couples this to the outer dispatcher, so the
/// whole policy lives in this one function.
pub fn classify(volume_name: &str, inline_reference: Option<&str>) -> VolumeKind {
    if is_static_volume(volume_name) {
        VolumeKind::Static
    } else if inline_reference.is_some_and(|r| !r.trim().is_empty()) {
        VolumeKind::StaticInline
    } else {
        VolumeKind::DynamicRoot
    }
}
