//! modelvol - node-local OCI model-volume driver.
//!
//! Materializes OCI-packaged model artifacts (weights and metadata stored
//! as image layers) as read-only volumes for workloads on a container
//! orchestration platform. The crate is the node-side lifecycle engine:
//! pulling with single-flight deduplication and cancellation, durable
//! per-volume status, disk-quota admission, bind-mount composition, and a
//! per-volume control socket for dynamically managed mounts.
//!
//! # Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`service`] | Facade wiring the whole driver together. |
//! | [`worker`] | Pull/delete engine: single-flight, cancellation, cleanup. |
//! | [`volume`] | Classification, provisioning, publish/unpublish. |
//! | [`dynserver`] | Per-volume HTTP control servers on UNIX sockets. |
//! | [`pull`] | Pull orchestration, progress hook, exclusion patterns. |
//! | [`artifact`] | Inspected artifact: sizes and file patterns. |
//! | [`quota`] | Disk-usage accounting and admission. |
//! | [`status`] | Durable JSON status documents. |
//! | [`mount`] | Mount commands and mount-table inspection. |
//! | [`sync`] | Keyed mutex, single-flight group, retry. |
//! | [`cache`] | Periodic scan of materialized mounts. |
//! | [`backend`] | External pull-backend and keychain interfaces. |
//! | [`client`] | UDS HTTP client for the control API. |
//! | [`api`] | Wire types of the control API. |
//! | [`config`] | Configuration and directory layout. |
//! | [`telemetry`] | Observation sink and size bucketing. |
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use modelvol::config::Config;
//! use modelvol::mount::SysMounter;
//! use modelvol::service::ModelVolumeService;
//! use modelvol::telemetry::NoopSink;
//!
//! let cfg = Config::new("model.csi.example.com", "/var/lib/modelvol");
//! let service = ModelVolumeService::new(
//!     cfg,
//!     backend,          // an OCI pull backend implementation
//!     keychain,         // registry scheme resolution
//!     Arc::new(SysMounter::new()),
//!     Arc::new(NoopSink),
//! )?;
//! service.recover().await?;
//! ```

pub mod api;
pub mod artifact;
pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod dynserver;
pub mod error;
pub mod fsutil;
pub mod logging;
pub mod mount;
pub mod pull;
pub mod quota;
pub mod service;
pub mod status;
pub mod sync;
pub mod telemetry;
pub mod volume;
pub mod worker;

pub use error::{Error, Result};

/// Version of the modelvol library, synchronized across the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
