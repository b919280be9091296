//! Default configuration constants for voxcompose.
//!
//! Shared by the TOML configuration, the CLI, and the pipeline so that every
//! entry point agrees on the same baseline behavior.

/// Default model name sent to the backend.
pub const DEFAULT_MODEL: &str = "llama3.1";

/// Default backend base URL (local Ollama).
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:11434";

/// Default output format named in the instructions.
pub const DEFAULT_FORMAT: &str = "markdown";

/// Maximum chunk length in characters.
///
/// Roughly 1500 tokens of English input, which leaves room for the system
/// prompt and an output of similar size in a 4k context window.
pub const MAX_CHUNK_SIZE: usize = 6000;

/// Characters repeated from the end of the previous chunk.
pub const OVERLAP_SIZE: usize = 300;

/// Maximum number of completion requests in flight.
pub const CONCURRENCY_LIMIT: usize = 4;

/// Total attempts per chunk, including the first one.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Per-attempt HTTP timeout in milliseconds.
pub const REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Delay before the first retry; doubles on each further retry.
pub const RETRY_BASE_DELAY_MS: u64 = 500;

/// Upper bound for a single backoff delay.
pub const RETRY_MAX_DELAY_MS: u64 = 8_000;

/// Trailing characters of the previous fragment handed to the next prompt.
pub const CONTINUITY_TAIL_CHARS: usize = 400;

/// Minimum normalized characters for a boundary match to count as overlap.
///
/// Shorter matches are too likely to be coincidental ("and the"), so the
/// fragments are joined with a blank line instead.
pub const MIN_OVERLAP_CHARS: usize = 12;

/// How far back into the merged output the overlap search looks.
pub const MAX_OVERLAP_CHARS: usize = 2_000;

/// Fraction of words that may differ in a fuzzy boundary match.
pub const FUZZY_OVERLAP_RATIO: f32 = 0.15;

/// Maximum cached chunk refinements.
pub const CACHE_MAX_SIZE: usize = 100;

/// Cache entry lifetime in milliseconds (one hour).
pub const CACHE_TTL_MS: u64 = 3_600_000;

/// Most recent memory items injected into the prompt.
pub const MEMORY_MAX_ITEMS: usize = 20;
