//! Command-line interface for voxcompose
//!
//! Provides argument parsing using clap derive macros.

use crate::config::Config;
use crate::error::{Result, VoxError};
use crate::refine::Provider;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Refine speech transcripts into structured Markdown
#[derive(Parser, Debug)]
#[command(
    name = "voxcompose",
    version,
    about = "Refine speech transcripts into structured Markdown"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Transcript file to refine (default: stdin, or "-")
    #[arg(value_name = "INPUT")]
    pub input: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress diagnostics except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose diagnostics (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write the document to this file
    #[arg(long, short = 'o', value_name = "FILE")]
    pub out: Option<PathBuf>,

    /// Write run metadata as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub sidecar: Option<PathBuf>,

    /// Model name (e.g. llama3.1, gpt-4o-mini)
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Backend base URL (e.g. http://127.0.0.1:11434)
    #[arg(long, value_name = "URL")]
    pub api_url: Option<String>,

    /// Backend dialect (ollama, openai)
    #[arg(long, value_name = "PROVIDER")]
    pub provider: Option<Provider>,

    /// Read the API key from this environment variable
    #[arg(long, value_name = "VAR")]
    pub api_key_env: Option<String>,

    /// Per-request timeout. Examples: 30, 45s, 2m
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Abort the whole run after this long. Examples: 5m, 1h
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub run_timeout: Option<Duration>,

    /// JSONL file of preferences and glossary items
    #[arg(long, value_name = "FILE")]
    pub memory: Option<PathBuf>,

    /// Output format named in the instructions
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Reuse refinements of identical chunks within this run
    #[arg(long)]
    pub cache: bool,

    /// Maximum cached refinements (0 stores nothing)
    #[arg(long, value_name = "N")]
    pub cache_size: Option<usize>,

    /// Time-to-live of cached refinements in milliseconds
    #[arg(long, value_name = "MS")]
    pub cache_ttl_ms: Option<u64>,

    /// Maximum chunk size in characters
    #[arg(long, value_name = "CHARS")]
    pub chunk_size: Option<usize>,

    /// Characters shared between neighbouring chunks
    #[arg(long, value_name = "CHARS")]
    pub overlap: Option<usize>,

    /// Maximum requests in flight
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Total attempts per chunk, including the first
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Refine chunks in order, passing each refined part as context to the next
    #[arg(long)]
    pub strict_continuity: bool,

    /// Emit a document with placeholders when chunks fail (still exits non-zero)
    #[arg(long)]
    pub partial: bool,

    /// Print the transcript unchanged
    #[arg(long)]
    pub no_refine: bool,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`, `2m30s`).
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    // Bare number → seconds
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Action to perform
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Get a configuration value (e.g. refine.max_chunk_size)
    Get {
        /// Dotted key
        key: String,
    },
    /// Set a configuration value in the config file
    Set {
        /// Dotted key
        key: String,
        /// New value
        value: String,
    },
    /// Show the effective configuration, or one section of it
    List {
        /// Section to show (model, refine, cache, memory)
        key: Option<String>,
    },
    /// Print a commented configuration template
    Dump,
    /// Print the configuration file path
    Path,
}

impl Cli {
    /// Applies command-line overrides on top of file and environment values.
    pub fn apply_overrides(&self, config: &mut Config) -> Result<()> {
        if let Some(model) = &self.model {
            config.model.model = model.clone();
            config.sources.model = "flag".to_string();
        }
        if let Some(url) = &self.api_url {
            config.model.endpoint = url.clone();
            config.sources.endpoint = "flag".to_string();
        }
        if let Some(provider) = self.provider {
            config.model.provider = provider;
        }
        if let Some(var) = &self.api_key_env {
            let key = std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    VoxError::config("model.api_key", format!("environment variable {} is not set", var))
                })?;
            config.model.api_key = Some(key.trim().to_string());
        }
        if let Some(timeout) = self.timeout {
            config.refine.request_timeout_ms = timeout.as_millis() as u64;
        }
        if let Some(path) = &self.memory {
            config.memory.path = Some(path.clone());
        }
        if let Some(format) = &self.format {
            config.model.format = format.clone();
        }
        if self.cache {
            config.cache.enabled = true;
        }
        if let Some(size) = self.cache_size {
            config.cache.max_size = size;
        }
        if let Some(ttl_ms) = self.cache_ttl_ms {
            config.cache.ttl_ms = ttl_ms;
        }
        if let Some(size) = self.chunk_size {
            config.refine.max_chunk_size = size;
        }
        if let Some(overlap) = self.overlap {
            config.refine.overlap_size = overlap;
        }
        if let Some(limit) = self.concurrency {
            config.refine.concurrency_limit = limit;
        }
        if let Some(attempts) = self.retries {
            config.refine.max_retry_attempts = attempts;
        }
        if self.strict_continuity {
            config.refine.strict_continuity = true;
        }
        if self.partial {
            config.refine.partial_on_failure = true;
        }
        if self.no_refine {
            config.refine.enabled = false;
        }
        Ok(())
    }
}
