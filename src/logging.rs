//! Diagnostic logging setup.
//!
//! Events go to stderr so stdout carries only the refined document.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Default filter for a verbosity level when `RUST_LOG` is unset.
pub fn default_filter(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "warn",
        1 => "voxcompose=debug,warn",
        _ => "trace",
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over flags.
///
/// Safe to call more than once; later calls are ignored.
pub fn init(verbosity: u8, quiet: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity, quiet)));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbosity > 1),
        )
        .try_init();
    if let Err(e) = result {
        tracing::debug!(error = %e, "logging already initialized");
    }
}
