//! Transcript refinement pipeline.
//!
//! Turns an arbitrarily long transcript into one Markdown document:
//! ```text
//! Transcript ─▶ Chunker ─▶ Prompt Builder ─▶ Model Client (bounded, retried) ─▶ Merge Engine
//! ```

pub mod chunker;
pub mod client;
pub mod merge;
pub mod pipeline;
pub mod prompt;
pub mod types;

pub use chunker::{ChunkerConfig, chunk};
pub use client::{
    ClientConfig, CompletionBackend, MockBackend, ModelClient, Provider, RetryPolicy,
    normalize_endpoint,
};
pub use merge::{MergeOptions, merge};
pub use pipeline::{ChunkProgress, Pipeline, PipelineConfig};
pub use prompt::{Continuity, PromptBuilder};
pub use types::{
    Chunk, ChunkFailure, CompletionRequest, CompletionResult, ManifestEntry, MergedDocument,
    RequestState,
};
