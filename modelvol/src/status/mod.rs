//! Durable per-volume and per-mount status documents.
//!
//! One pretty-printed JSON document per materialized unit, written under a
//! deterministic path (`.../status.json`). Writes go through a single
//! process-wide mutex; they are truncating rather than atomic, so readers
//! treat an empty or unparseable file as "not written yet".

use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a materialized unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    #[serde(rename = "PULLING")]
    Pulling,
    #[serde(rename = "PULL_SUCCEEDED")]
    PullSucceeded,
    #[serde(rename = "PULL_FAILED")]
    PullFailed,
    #[serde(rename = "PULL_TIMEOUT")]
    PullTimeout,
    #[serde(rename = "PULL_CANCELED")]
    PullCanceled,
    #[serde(rename = "MOUNTED")]
    Mounted,
    #[serde(rename = "UMOUNTED")]
    Umounted,
}

impl State {
    /// The wire name, as written into status documents.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Pulling => "PULLING",
            State::PullSucceeded => "PULL_SUCCEEDED",
            State::PullFailed => "PULL_FAILED",
            State::PullTimeout => "PULL_TIMEOUT",
            State::PullCanceled => "PULL_CANCELED",
            State::Mounted => "MOUNTED",
            State::Umounted => "UMOUNTED",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one layer within an in-flight pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressItem {
    pub digest: String,
    pub path: String,
    pub size: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Pull progress: total distinct layers and the per-layer records, ordered
/// by start time (digest as tiebreaker).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub items: Vec<ProgressItem>,
}

/// The status document. Unknown fields are ignored on read so the schema
/// stays forward compatible.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
    #[serde(default)]
    pub progress: Progress,
}

/// Serialized access to status documents.
///
/// A single instance is shared by every component that reads or writes
/// status; the internal mutex is the process-wide writer lock.
#[derive(Default)]
pub struct StatusStore {
    lock: Mutex<()>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `status` to `path`, creating parent directories as needed.
    pub fn set(&self, path: &Path, status: &Status) -> Result<()> {
        let _guard = self.lock.lock().unwrap();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("create status dir: {e}")))?;
        }

        let data = serde_json::to_vec_pretty(status)
            .map_err(|e| Error::Internal(format!("marshal status: {e}")))?;

        fs::write(path, data)
            .map_err(|e| Error::Internal(format!("write status file {}: {e}", path.display())))
    }

    /// Read the status at `path`.
    ///
    /// A missing, empty, or unparseable file yields [`Error::NotFound`] so
    /// callers can distinguish "never written" from a real read error.
    pub fn get(&self, path: &Path) -> Result<Status> {
        let _guard = self.lock.lock().unwrap();

        let data = fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("status not found: {}", path.display()))
            } else {
                Error::Internal(format!("read status file {}: {e}", path.display()))
            }
        })?;

        let text = String::from_utf8_lossy(&data);
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::NotFound(format!(
                "status file is empty: {}",
                path.display()
            )));
        }

        serde_json::from_str(text).map_err(|_| {
            Error::NotFound(format!(
                "status file is unreadable: {}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sample_status() -> Status {
        Status {
            volume_name: "pvc-a".into(),
            mount_id: String::new(),
            reference: "example.com/model:10mb".into(),
            state: Some(State::PullSucceeded),
            inline: false,
            progress: Progress {
                total: 2,
                items: vec![ProgressItem {
                    digest: "sha256:aaa".into(),
                    path: "/model-1.safetensor".into(),
                    size: 42,
                    started_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
                    finished_at: None,
                    error: None,
                }],
            },
        }
    }

    #[test]
    fn test_set_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("volumes/pvc-a/status.json");
        let store = StatusStore::new();

        let status = sample_status();
        store.set(&path, &status).unwrap();
        let loaded = store.get(&path).unwrap();
        assert_eq!(loaded, status);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::new();
        let err = store.get(&dir.path().join("status.json")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_get_empty_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, "  \n").unwrap();
        let store = StatusStore::new();
        assert!(store.get(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_garbage_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = StatusStore::new();
        assert!(store.get(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(
            &path,
            r#"{"volume_name": "pvc-a", "state": "MOUNTED", "added_in_v2": true}"#,
        )
        .unwrap();
        let store = StatusStore::new();
        let status = store.get(&path).unwrap();
        assert_eq!(status.volume_name, "pvc-a");
        assert_eq!(status.state, Some(State::Mounted));
    }

    #[test]
    fn test_state_wire_names() {
        for (state, name) in [
            (State::Pulling, "\"PULLING\""),
            (State::PullSucceeded, "\"PULL_SUCCEEDED\""),
            (State::PullFailed, "\"PULL_FAILED\""),
            (State::PullTimeout, "\"PULL_TIMEOUT\""),
            (State::PullCanceled, "\"PULL_CANCELED\""),
            (State::Mounted, "\"MOUNTED\""),
            (State::Umounted, "\"UMOUNTED\""),
        ] {
            assert_eq!(serde_json::to_string(&state).unwrap(), name);
        }
    }

    #[test]
    fn test_dynamic_root_status_omits_empty_fields() {
        let status = Status {
            volume_name: "csi-a".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("mount_id"));
        assert!(!json.contains("state"));
        assert!(!json.contains("inline"));
    }
}
