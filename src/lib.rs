//! voxcompose - Refine speech transcripts into structured Markdown
//!
//! Splits long transcripts into overlapping chunks, refines them against a
//! local or OpenAI-compatible model backend, and merges the fragments into
//! one deduplicated document.

// Enforce error handling discipline: propagate, don't panic
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
#[cfg(feature = "cli")]
pub mod logging;
pub mod memory;
pub mod refine;
pub mod sidecar;
pub mod transcript;

// L4 composition root - needs everything
#[cfg(feature = "cli")]
pub mod app;

// Core seam (request → fragment)
pub use refine::client::CompletionBackend;

// Pipeline
pub use refine::{MergedDocument, Pipeline, PipelineConfig};
pub use transcript::Transcript;

// Error handling
pub use error::{Result, VoxError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.0+abc1234"` when git hash is available, `"0.3.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
