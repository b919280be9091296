//! Value types passed between the refinement stations.

use crate::error::VoxError;
use crate::transcript::Transcript;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Contiguous character window `[start, end)` of a transcript.
///
/// The first `overlap_prefix_len` characters repeat the tail of the previous
/// chunk; the last `overlap_suffix_len` characters are repeated by the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub overlap_prefix_len: usize,
    pub overlap_suffix_len: usize,
}

impl Chunk {
    /// Length in characters, overlap included.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Start of the content not shared with the previous chunk.
    pub fn core_start(&self) -> usize {
        self.start + self.overlap_prefix_len
    }

    /// Full chunk text, overlap included.
    pub fn text<'a>(&self, transcript: &'a Transcript) -> &'a str {
        transcript.slice(self.start, self.end)
    }

    /// Chunk text without the overlap prefix.
    pub fn core_text<'a>(&self, transcript: &'a Transcript) -> &'a str {
        transcript.slice(self.core_start(), self.end)
    }

    /// The overlap prefix shared with the previous chunk.
    pub fn overlap_text<'a>(&self, transcript: &'a Transcript) -> &'a str {
        transcript.slice(self.start, self.core_start())
    }
}

/// One completion request, built once per chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub chunk_index: usize,
    /// System instructions.
    pub system: String,
    /// User prompt: continuity context followed by the chunk text.
    pub prompt: String,
    pub is_first: bool,
    pub is_last: bool,
}

/// Terminal failure of a single chunk.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkFailure {
    #[error("request rejected (HTTP {status}): {body}")]
    RequestRejected { status: u16, body: String },

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("unexpected response format: {message}")]
    ResponseFormat { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl From<ChunkFailure> for VoxError {
    fn from(failure: ChunkFailure) -> Self {
        match failure {
            ChunkFailure::RequestRejected { status, body } => {
                VoxError::RequestRejected { status, body }
            }
            ChunkFailure::RetriesExhausted {
                attempts,
                last_error,
            } => VoxError::TerminalFailure {
                attempts,
                last_error,
            },
            ChunkFailure::ResponseFormat { message } => VoxError::ResponseFormat { message },
            ChunkFailure::Cancelled => VoxError::Cancelled,
        }
    }
}

/// Outcome of a completion request after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    pub chunk_index: usize,
    pub outcome: std::result::Result<String, ChunkFailure>,
    /// HTTP attempts made; zero for cache hits and cancelled-before-send.
    pub attempts: u32,
    /// Served from the refine cache.
    pub cached: bool,
}

impl CompletionResult {
    pub fn success(chunk_index: usize, fragment: impl Into<String>, attempts: u32) -> Self {
        Self {
            chunk_index,
            outcome: Ok(fragment.into()),
            attempts,
            cached: false,
        }
    }

    pub fn failure(chunk_index: usize, failure: ChunkFailure, attempts: u32) -> Self {
        Self {
            chunk_index,
            outcome: Err(failure),
            attempts,
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// The refined fragment, if the request succeeded.
    pub fn fragment(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }
}

/// Lifecycle of a completion request inside the model client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Sending { attempt: u32 },
    RetryableFailure { attempt: u32 },
    Succeeded,
    TerminalFailure,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Pending => write!(f, "pending"),
            RequestState::Sending { attempt } => write!(f, "sending (attempt {})", attempt),
            RequestState::RetryableFailure { attempt } => {
                write!(f, "retryable failure (attempt {})", attempt)
            }
            RequestState::Succeeded => write!(f, "succeeded"),
            RequestState::TerminalFailure => write!(f, "terminal failure"),
        }
    }
}

/// Byte span of the merged output contributed by one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub chunk_index: usize,
    pub span: Range<usize>,
}

/// Final merged Markdown document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergedDocument {
    pub markdown: String,
    pub manifest: Vec<ManifestEntry>,
    /// Chunks replaced by placeholders, with their failures, in chunk order.
    pub failures: Vec<(usize, ChunkFailure)>,
}

impl MergedDocument {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Zero-based indices of chunks replaced by placeholders.
    pub fn failed_chunks(&self) -> Vec<usize> {
        self.failures.iter().map(|(i, _)| *i).collect()
    }

    /// The error a partial document stands for, naming the failed range and
    /// the last underlying failure.
    pub fn failure_error(&self) -> Option<VoxError> {
        crate::refine::merge::report_failures(&self.failures)
    }
}
