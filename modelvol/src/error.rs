//! Crate-wide error type.
//!
//! Every fallible operation in this crate returns [`Error`]. The variants
//! are semantic kinds rather than source types: callers (and the dynamic
//! HTTP server) dispatch on the kind, so wrapping keeps the kind intact.
//! Payloads are plain strings, which keeps the type `Clone`; broadcasting
//! one result to every waiter of a coalesced operation requires that.

use thiserror::Error;

/// Unified error type for driver operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A caller supplied a missing or malformed identifier, path, or flag.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A status document or dynamic mount does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A dynamic mount id was re-used with a different model reference.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Disk-quota admission rejected the pull.
    #[error("insufficient disk quota: {0}")]
    InsufficientQuota(String),

    /// The operation was canceled mid-flight.
    #[error("canceled: {0}")]
    Canceled(String),

    /// The operation ran past its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Any unclassified failure: I/O, mount tool, pull backend.
    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Create an [`Error::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Prefix the message with `context`, preserving the error kind.
    pub fn context(self, context: impl std::fmt::Display) -> Self {
        let wrap = |msg: String| format!("{context}: {msg}");
        match self {
            Self::InvalidArgument(m) => Self::InvalidArgument(wrap(m)),
            Self::NotFound(m) => Self::NotFound(wrap(m)),
            Self::Conflict(m) => Self::Conflict(wrap(m)),
            Self::InsufficientQuota(m) => Self::InsufficientQuota(wrap(m)),
            Self::Canceled(m) => Self::Canceled(wrap(m)),
            Self::DeadlineExceeded(m) => Self::DeadlineExceeded(wrap(m)),
            Self::Internal(m) => Self::Internal(wrap(m)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_insufficient_quota(&self) -> bool {
        matches!(self, Self::InsufficientQuota(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled(_))
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
