//! Refinement entry point.
//!
//! Orchestrates the complete transcript-to-Markdown flow:
//! read → chunk → refine → merge → write

use crate::cache::RefineCache;
use crate::config::Config;
use crate::error::{Result, VoxError};
use crate::memory::build_memory_prompt;
use crate::refine::{ClientConfig, ModelClient, Pipeline, PipelineConfig, PromptBuilder};
use crate::sidecar::Sidecar;
use crate::transcript::{Transcript, read_source};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Where to read from and write to for one run.
#[derive(Debug, Clone, Default)]
pub struct RefineOptions {
    /// Transcript file; stdin when `None` or `-`.
    pub input: Option<PathBuf>,
    pub out: Option<PathBuf>,
    pub sidecar: Option<PathBuf>,
    /// Cancel the whole run after this long.
    pub run_timeout: Option<Duration>,
}

/// Run the refine command: read transcript → refine → print Markdown.
///
/// Empty input produces no output. With refinement disabled the transcript
/// is printed unchanged. In partial mode the document with placeholders is
/// still written before the failure is returned.
pub async fn run_refine_command(config: Config, options: RefineOptions) -> Result<()> {
    config.validate()?;

    let raw = read_source(options.input.as_deref())?;
    if raw.trim().is_empty() {
        tracing::debug!("empty input, nothing to refine");
        return Ok(());
    }

    let mut sidecar = Sidecar::from_config(&config);

    if !config.refine.enabled {
        tracing::info!("Refinement disabled, passing transcript through");
        emit(&raw, options.out.as_deref())?;
        sidecar.ok = true;
        return write_sidecar(&sidecar, options.sidecar.as_deref());
    }

    let transcript = Transcript::new(raw);

    let (memory, memory_items) = match &config.memory.path {
        Some(path) => build_memory_prompt(path, config.memory.max_items)?,
        None => (None, 0),
    };
    sidecar.memory_items_used = memory_items;

    let prompts = PromptBuilder::new(config.model.format.clone()).with_memory(memory);
    let client = ModelClient::new(ClientConfig::from_config(&config))?;
    tracing::info!(
        provider = %config.model.provider,
        model = %config.model.model,
        model_source = %config.sources.model,
        url = client.url(),
        endpoint_source = %config.sources.endpoint,
        "Using model backend"
    );

    let mut pipeline = Pipeline::new(client, prompts, PipelineConfig::from_config(&config));
    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(RefineCache::from_config(&config.cache)));
    if let Some(cache) = &cache {
        pipeline = pipeline.with_cache(Arc::clone(cache));
    }
    sidecar.chunks = pipeline.config().chunker.chunk(&transcript)?.len();

    let cancel = CancellationToken::new();
    let watcher = spawn_cancel_watcher(cancel.clone(), options.run_timeout);

    let started = Instant::now();
    let outcome = pipeline
        .refine_with_callback(&transcript, &cancel, |progress| {
            tracing::info!(
                chunk = progress.chunk_index,
                completed = progress.completed,
                total = progress.total,
                ok = progress.ok,
                attempts = progress.attempts,
                cached = progress.cached,
                "Chunk finished"
            );
        })
        .await;
    watcher.abort();

    sidecar.refine_ms = started.elapsed().as_millis() as u64;
    sidecar.cache = cache.as_ref().map(|c| c.stats());

    match outcome {
        Ok(document) => {
            sidecar.failed_chunks = document.failed_chunks();
            sidecar.ok = !document.is_partial();
            emit(&with_trailing_newline(&document.markdown), options.out.as_deref())?;
            write_sidecar(&sidecar, options.sidecar.as_deref())?;

            match document.failure_error() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
        Err(e) => {
            if let VoxError::Merge { failed, .. } = &e {
                sidecar.failed_chunks = failed.clone();
            }
            if let Err(write_err) = write_sidecar(&sidecar, options.sidecar.as_deref()) {
                tracing::warn!(error = %write_err, "Failed to write sidecar");
            }
            Err(e)
        }
    }
}

/// Cancels `cancel` on Ctrl+C or when the run timeout elapses.
fn spawn_cancel_watcher(
    cancel: CancellationToken,
    run_timeout: Option<Duration>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = async {
            match run_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to wait for Ctrl+C");
                    return;
                }
                tracing::warn!("Interrupted, cancelling refinement");
            }
            _ = deadline => {
                tracing::warn!(timeout = ?run_timeout, "Run timeout reached, cancelling refinement");
            }
        }
        cancel.cancel();
    })
}

fn with_trailing_newline(text: &str) -> String {
    if text.is_empty() || text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

/// Writes the document to stdout and, when given, to `out`.
fn emit(text: &str, out: Option<&Path>) -> Result<()> {
    if let Some(path) = out {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        tracing::debug!(path = %path.display(), "wrote document");
    }
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

fn write_sidecar(sidecar: &Sidecar, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => sidecar.write(path),
        None => Ok(()),
    }
}
