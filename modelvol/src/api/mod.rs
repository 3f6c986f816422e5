//! Wire types of the dynamic mount HTTP API.
//!
//! Shared by the per-volume server, the UDS client, and the operator CLI.
//! Content type is `application/json` throughout.

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const CODE_INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
pub const CODE_INTERNAL: &str = "INTERNAL";
pub const CODE_NOT_FOUND: &str = "NOT_FOUND";
pub const CODE_INSUFFICIENT_DISK_QUOTA: &str = "INSUFFICIENT_DISK_QUOTA";

/// Body of `POST /api/v1/volumes/{volume}/mounts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountRequest {
    #[serde(default)]
    pub mount_id: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub check_disk_quota: bool,
    #[serde(default)]
    pub exclude_model_weights: bool,
    #[serde(default)]
    pub exclude_file_patterns: Vec<String>,
}

/// Error body returned for every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Map the body back to the error kind it encodes.
    pub fn into_error(self) -> Error {
        match self.code.as_str() {
            CODE_INVALID_ARGUMENT => Error::InvalidArgument(self.message),
            CODE_NOT_FOUND => Error::NotFound(self.message),
            CODE_INSUFFICIENT_DISK_QUOTA => Error::InsufficientQuota(self.message),
            _ => Error::Internal(self.message),
        }
    }
}
