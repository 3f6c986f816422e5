//! Logging setup shared by binaries embedding the driver.
//!
//! Structured logs go through `tracing`; this helper installs a stdout
//! subscriber with an env-filter so `RUST_LOG` (or the given default
//! level) controls verbosity.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `default_level` applies when
/// `RUST_LOG` is not set (e.g. "info", "modelvol=debug").
pub fn init_logging(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}
