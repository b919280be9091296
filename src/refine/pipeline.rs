//! Refinement pipeline orchestrator.
//!
//! Wires the stations together:
//! ```text
//! ┌────────────┐    ┌─────────┐    ┌──────────────┐    ┌─────────┐    ┌────────┐
//! │ Transcript │───▶│ Chunker │───▶│Prompt Builder│───▶│  Model  │───▶│ Merge  │───▶ Markdown
//! │            │    │         │    │              │    │ Client  │    │ Engine │
//! └────────────┘    └─────────┘    └──────────────┘    └─────────┘    └────────┘
//!                                         ▲   strict continuity  │
//!                                         └──── prior fragment ──┘
//! ```
//!
//! Relaxed continuity dispatches every chunk at once under a semaphore;
//! strict continuity chains them so each prompt sees the previous fragment.

use crate::cache::{RefineCache, cache_key};
use crate::config::Config;
use crate::defaults;
use crate::error::{Result, VoxError};
use crate::refine::chunker::ChunkerConfig;
use crate::refine::client::CompletionBackend;
use crate::refine::merge::{MergeOptions, merge};
use crate::refine::prompt::{Continuity, PromptBuilder, tail};
use crate::refine::types::{Chunk, ChunkFailure, CompletionRequest, CompletionResult, MergedDocument};
use crate::transcript::Transcript;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Pipeline settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    /// Maximum completion requests in flight.
    pub concurrency_limit: usize,
    /// Chain chunks so each prompt carries the previous refined fragment.
    pub strict_continuity: bool,
    /// Characters of the previous fragment passed in strict mode.
    pub continuity_tail_chars: usize,
    pub merge: MergeOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            concurrency_limit: defaults::CONCURRENCY_LIMIT,
            strict_continuity: false,
            continuity_tail_chars: defaults::CONTINUITY_TAIL_CHARS,
            merge: MergeOptions::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        let refine = &config.refine;
        Self {
            chunker: ChunkerConfig::new(refine.max_chunk_size, refine.overlap_size),
            concurrency_limit: refine.concurrency_limit,
            strict_continuity: refine.strict_continuity,
            continuity_tail_chars: refine.continuity_tail_chars,
            merge: MergeOptions {
                min_overlap_chars: refine.min_overlap_chars,
                max_overlap_chars: refine.max_overlap_chars,
                fuzzy_ratio: refine.fuzzy_overlap_ratio,
                partial_on_failure: refine.partial_on_failure,
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.chunker.validate()?;
        if self.concurrency_limit == 0 {
            return Err(VoxError::config(
                "refine.concurrency_limit",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Progress report for one finished chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunk_index: usize,
    /// Chunks finished so far, this one included.
    pub completed: usize,
    pub total: usize,
    pub ok: bool,
    pub attempts: u32,
    pub cached: bool,
}

/// Runs chunk, prompt, complete, and merge for one transcript.
pub struct Pipeline<B: CompletionBackend> {
    backend: Arc<B>,
    prompts: PromptBuilder,
    config: PipelineConfig,
    cache: Option<Arc<RefineCache>>,
}

/// Write-once results table indexed by chunk.
struct Results {
    slots: Vec<Option<CompletionResult>>,
    completed: usize,
}

impl<B: CompletionBackend + 'static> Pipeline<B> {
    pub fn new(backend: B, prompts: PromptBuilder, config: PipelineConfig) -> Self {
        Self::from_arc(Arc::new(backend), prompts, config)
    }

    pub fn from_arc(backend: Arc<B>, prompts: PromptBuilder, config: PipelineConfig) -> Self {
        Self {
            backend,
            prompts,
            config,
            cache: None,
        }
    }

    /// Serve repeated requests from `cache`.
    pub fn with_cache(mut self, cache: Arc<RefineCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Refines `transcript` into one Markdown document.
    pub async fn refine(
        &self,
        transcript: &Transcript,
        cancel: &CancellationToken,
    ) -> Result<MergedDocument> {
        self.refine_with_callback(transcript, cancel, |_| {}).await
    }

    /// Same as [`refine`](Self::refine), reporting each finished chunk.
    pub async fn refine_with_callback<F>(
        &self,
        transcript: &Transcript,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<MergedDocument>
    where
        F: FnMut(&ChunkProgress),
    {
        self.config.validate()?;
        let chunks = self.config.chunker.chunk(transcript)?;
        if chunks.is_empty() {
            return Ok(MergedDocument::default());
        }

        tracing::info!(
            chunks = chunks.len(),
            chars = transcript.len(),
            concurrency = self.config.concurrency_limit,
            strict = self.config.strict_continuity,
            model = self.backend.model_name(),
            "Refining transcript"
        );

        // Cancelled on the first terminal failure so queued chunks are skipped.
        let run = cancel.child_token();
        let mut results = Results {
            slots: vec![None; chunks.len()],
            completed: 0,
        };

        if self.config.strict_continuity {
            self.run_strict(transcript, &chunks, &run, &mut results, &mut on_progress)
                .await;
        } else {
            self.run_relaxed(transcript, &chunks, &run, &mut results, &mut on_progress)
                .await?;
        }

        if cancel.is_cancelled() {
            tracing::warn!(completed = results.completed, "Refinement cancelled");
            return Err(VoxError::Cancelled);
        }

        let ordered: Vec<CompletionResult> = results
            .slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.unwrap_or_else(|| CompletionResult::failure(i, ChunkFailure::Cancelled, 0))
            })
            .collect();
        merge(ordered, &self.config.merge)
    }

    async fn run_relaxed<F>(
        &self,
        transcript: &Transcript,
        chunks: &[Chunk],
        run: &CancellationToken,
        results: &mut Results,
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&ChunkProgress),
    {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let mut tasks = JoinSet::new();
        let last = chunks.len() - 1;
        let stop_on_failure = !self.config.merge.partial_on_failure;

        for chunk in chunks {
            // Acquire before building the request so queued chunks cost nothing.
            let permit = tokio::select! {
                biased;
                _ = run.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let context = raw_overlap(chunk, transcript);
            let request = self.prompts.build(
                chunk,
                chunk.text(transcript),
                context,
                chunk.index == 0,
                chunk.index == last,
            );

            if let Some(hit) = self.lookup(&request) {
                drop(permit);
                self.record(hit, &request, run, results, on_progress);
                continue;
            }

            let backend = self.backend.clone();
            let token = run.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = backend.complete(&request, &token).await;
                if stop_on_failure
                    && matches!(&result.outcome, Err(f) if *f != ChunkFailure::Cancelled)
                {
                    token.cancel();
                }
                (request, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((request, result)) => self.record(result, &request, run, results, on_progress),
                Err(e) => {
                    run.cancel();
                    tracing::error!(error = %e, "Refinement task failed");
                    return Err(VoxError::Other(format!("Refinement task failed: {}", e)));
                }
            }
        }
        Ok(())
    }

    async fn run_strict<F>(
        &self,
        transcript: &Transcript,
        chunks: &[Chunk],
        run: &CancellationToken,
        results: &mut Results,
        on_progress: &mut F,
    ) where
        F: FnMut(&ChunkProgress),
    {
        let last = chunks.len() - 1;
        let mut previous: Option<String> = None;

        for chunk in chunks {
            if run.is_cancelled() {
                break;
            }

            let prior_tail = previous
                .as_deref()
                .map(|fragment| tail(fragment, self.config.continuity_tail_chars));
            let context = match prior_tail {
                Some(t) if chunk.index > 0 && !t.is_empty() => Continuity::PriorFragmentTail(t),
                _ => raw_overlap(chunk, transcript),
            };
            let request = self.prompts.build(
                chunk,
                chunk.text(transcript),
                context,
                chunk.index == 0,
                chunk.index == last,
            );

            let result = match self.lookup(&request) {
                Some(hit) => hit,
                None => self.backend.complete(&request, run).await,
            };
            previous = result.fragment().map(str::to_string);
            self.record(result, &request, run, results, on_progress);
        }
    }

    fn lookup(&self, request: &CompletionRequest) -> Option<CompletionResult> {
        let cache = self.cache.as_ref()?;
        let key = cache_key(self.backend.model_name(), &request.prompt, &request.system);
        let fragment = cache.get(&key)?;
        tracing::debug!(chunk = request.chunk_index, "Cache hit");
        Some(CompletionResult {
            chunk_index: request.chunk_index,
            outcome: Ok(fragment),
            attempts: 0,
            cached: true,
        })
    }

    fn record<F>(
        &self,
        result: CompletionResult,
        request: &CompletionRequest,
        run: &CancellationToken,
        results: &mut Results,
        on_progress: &mut F,
    ) where
        F: FnMut(&ChunkProgress),
    {
        match &result.outcome {
            Ok(fragment) => {
                if !result.cached
                    && let Some(cache) = &self.cache
                {
                    cache.put(
                        cache_key(self.backend.model_name(), &request.prompt, &request.system),
                        fragment.clone(),
                    );
                }
            }
            Err(ChunkFailure::Cancelled) => {}
            Err(failure) => {
                tracing::warn!(chunk = result.chunk_index, error = %failure, "Chunk failed");
                if !self.config.merge.partial_on_failure {
                    run.cancel();
                }
            }
        }

        results.completed += 1;
        on_progress(&ChunkProgress {
            chunk_index: result.chunk_index,
            completed: results.completed,
            total: results.slots.len(),
            ok: result.is_success(),
            attempts: result.attempts,
            cached: result.cached,
        });

        let index = result.chunk_index;
        debug_assert!(results.slots[index].is_none(), "chunk {} recorded twice", index);
        results.slots[index] = Some(result);
    }
}

fn raw_overlap<'a>(chunk: &Chunk, transcript: &'a Transcript) -> Continuity<'a> {
    if chunk.overlap_prefix_len == 0 {
        Continuity::None
    } else {
        Continuity::RawOverlap(chunk.overlap_text(transcript))
    }
}
