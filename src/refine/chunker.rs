//! Chunker station.
//!
//! Splits a transcript into overlapping windows that fit the model context:
//! - Greedy packing of whole segments (sentences or lines)
//! - Hard character cut only when a single segment exceeds `max_chunk_size`
//! - Overlap with the previous chunk, snapped forward to a segment start and
//!   shortened when it would force a cut inside the next segment
//!
//! Boundaries depend only on the transcript and the two size parameters.

use crate::defaults;
use crate::error::{Result, VoxError};
use crate::refine::types::Chunk;
use crate::transcript::Transcript;

/// Configuration for the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters, overlap included.
    pub max_chunk_size: usize,
    /// Characters repeated from the previous chunk.
    pub overlap_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: defaults::MAX_CHUNK_SIZE,
            overlap_size: defaults::OVERLAP_SIZE,
        }
    }
}

impl ChunkerConfig {
    pub fn new(max_chunk_size: usize, overlap_size: usize) -> Self {
        Self {
            max_chunk_size,
            overlap_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(VoxError::config(
                "refine.max_chunk_size",
                "must be greater than 0",
            ));
        }
        if self.overlap_size >= self.max_chunk_size {
            return Err(VoxError::config(
                "refine.overlap_size",
                format!(
                    "must be smaller than max_chunk_size ({} >= {})",
                    self.overlap_size, self.max_chunk_size
                ),
            ));
        }
        Ok(())
    }

    /// Splits the transcript into chunks.
    pub fn chunk(&self, transcript: &Transcript) -> Result<Vec<Chunk>> {
        self.validate()?;

        let total = transcript.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        if total <= self.max_chunk_size {
            return Ok(vec![Chunk {
                index: 0,
                start: 0,
                end: total,
                overlap_prefix_len: 0,
                overlap_suffix_len: 0,
            }]);
        }

        let seg_starts: Vec<usize> = transcript.segments().iter().map(|s| s.start).collect();
        let seg_ends: Vec<usize> = transcript.segments().iter().map(|s| s.end).collect();

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut start = 0;
        let mut core_start = 0;

        loop {
            let mut prefix = core_start - start;

            // Give up overlap before cutting a segment that fits on its own.
            let first_end = seg_ends
                .get(seg_ends.partition_point(|&e| e <= core_start))
                .copied()
                .unwrap_or(total);
            if first_end - core_start <= self.max_chunk_size
                && first_end > core_start + (self.max_chunk_size - prefix)
            {
                let min_start = first_end - self.max_chunk_size;
                let idx = seg_starts.partition_point(|&s| s < min_start);
                start = match seg_starts.get(idx) {
                    Some(&seg_start) if seg_start < core_start => seg_start,
                    _ => min_start,
                };
                prefix = core_start - start;
            }

            // prefix <= overlap_size < max_chunk_size, so the budget is at least 1
            let limit = core_start + (self.max_chunk_size - prefix);

            let end = if limit >= total {
                total
            } else {
                let idx = seg_ends.partition_point(|&e| e <= limit);
                match idx.checked_sub(1).map(|i| seg_ends[i]) {
                    Some(seg_end) if seg_end > core_start => seg_end,
                    _ => limit,
                }
            };

            if let Some(prev) = chunks.last_mut() {
                prev.overlap_suffix_len = prefix;
            }
            chunks.push(Chunk {
                index: chunks.len(),
                start,
                end,
                overlap_prefix_len: prefix,
                overlap_suffix_len: 0,
            });

            if end == total {
                break;
            }

            let window_start = end.saturating_sub(self.overlap_size).max(start);
            let idx = seg_starts.partition_point(|&s| s < window_start);
            start = match seg_starts.get(idx) {
                Some(&seg_start) if seg_start < end => seg_start,
                _ => window_start,
            };
            core_start = end;
        }

        tracing::debug!(
            chunks = chunks.len(),
            chars = total,
            max_chunk_size = self.max_chunk_size,
            overlap_size = self.overlap_size,
            "Chunked transcript"
        );
        Ok(chunks)
    }
}

/// Splits `transcript` into chunks of at most `max_chunk_size` characters
/// with up to `overlap_size` characters shared between neighbours.
pub fn chunk(
    transcript: &Transcript,
    max_chunk_size: usize,
    overlap_size: usize,
) -> Result<Vec<Chunk>> {
    ChunkerConfig::new(max_chunk_size, overlap_size).chunk(transcript)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(count: usize) -> Transcript {
        let text: String = (0..count)
            .map(|i| format!("Sentence number {:02} is here. ", i))
            .collect();
        Transcript::new(text)
    }

    fn reconstruct(t: &Transcript, chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.core_text(t)).collect()
    }

    #[test]
    fn test_zero_max_chunk_size_is_rejected() {
        let t = Transcript::new("hello");
        let err = chunk(&t, 0, 0).unwrap_err();
        assert!(matches!(err, VoxError::Configuration { ref key, .. } if key == "refine.max_chunk_size"));
    }

    #[test]
    fn test_overlap_not_smaller_than_max_is_rejected() {
        let t = Transcript::new("hello");
        let err = chunk(&t, 10, 10).unwrap_err();
        assert!(matches!(err, VoxError::Configuration { ref key, .. } if key == "refine.overlap_size"));
    }

    #[test]
    fn test_empty_transcript_yields_no_chunks() {
        let t = Transcript::new("");
        assert!(chunk(&t, 100, 10).unwrap().is_empty());
    }

    #[test]
    fn test_short_transcript_yields_single_chunk() {
        let t = Transcript::new("Short and sweet.");
        let chunks = chunk(&t, 100, 10).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(
            chunks[0],
            Chunk {
                index: 0,
                start: 0,
                end: t.len(),
                overlap_prefix_len: 0,
                overlap_suffix_len: 0
            }
        );
    }

    #[test]
    fn test_exact_fit_is_single_chunk() {
        let t = Transcript::new("x".repeat(50));
        assert_eq!(chunk(&t, 50, 5).unwrap().len(), 1);
    }

    #[test]
    fn test_chunks_end_on_sentence_boundaries() {
        let t = sentences(10);
        let chunks = chunk(&t, 100, 40).unwrap();
        assert!(chunks.len() > 1);
        for c in &chunks[..chunks.len() - 1] {
            assert!(
                t.segments().iter().any(|s| s.end == c.end),
                "chunk {} ends mid-sentence at {}",
                c.index,
                c.end
            );
        }
    }

    #[test]
    fn test_overlap_snaps_to_segment_start() {
        let t = sentences(10);
        let chunks = chunk(&t, 100, 40).unwrap();
        for c in &chunks[1..] {
            assert!(c.overlap_prefix_len > 0);
            assert!(c.overlap_text(&t).starts_with("Sentence"));
        }
    }

    #[test]
    fn test_chunk_invariants() {
        let t = sentences(25);
        let (max, overlap) = (120, 50);
        let chunks = chunk(&t, max, overlap).unwrap();

        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            assert!(c.len() <= max, "chunk {} too long: {}", i, c.len());
            assert!(c.overlap_prefix_len <= overlap);
        }
        assert_eq!(chunks[0].overlap_prefix_len, 0);
        assert_eq!(chunks.last().unwrap().overlap_suffix_len, 0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].overlap_suffix_len, pair[1].overlap_prefix_len);
            assert_eq!(pair[0].end, pair[1].core_start());
        }
        assert_eq!(reconstruct(&t, &chunks), t.text());
    }

    /// A sentence of exactly `len` characters, trailing space included.
    fn sentence(len: usize) -> String {
        format!("{}. ", "w".repeat(len - 2))
    }

    #[test]
    fn test_overlap_shrinks_instead_of_cutting_a_sentence() {
        let t = Transcript::new(format!("{}{}{}", sentence(52), sentence(82), sentence(31)));
        assert_eq!(t.segments().len(), 3);
        let chunks = chunk(&t, 100, 40).unwrap();

        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.len() <= 100, "chunk {} too long: {}", c.index, c.len());
            assert!(
                t.segments().iter().any(|s| s.end == c.end),
                "chunk {} ends mid-sentence at {}",
                c.index,
                c.end
            );
        }
        assert_eq!((chunks[1].start, chunks[1].end), (34, 134));
        assert_eq!(chunks[1].overlap_prefix_len, 18);
        assert_eq!(chunks[0].overlap_suffix_len, 18);
        assert_eq!(reconstruct(&t, &chunks), t.text());
    }

    #[test]
    fn test_long_segment_is_cut_at_budget() {
        let t = Transcript::new("a".repeat(250));
        let chunks = chunk(&t, 100, 20).unwrap();
        assert_eq!(chunks[0].end, 100);
        assert_eq!(chunks[1].start, 80);
        assert_eq!(chunks[1].end, 180);
        assert_eq!(chunks.last().unwrap().end, 250);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(reconstruct(&t, &chunks), t.text());
    }

    #[test]
    fn test_zero_overlap_gives_disjoint_chunks() {
        let t = sentences(10);
        let chunks = chunk(&t, 90, 0).unwrap();
        assert!(chunks.iter().all(|c| c.overlap_prefix_len == 0));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(reconstruct(&t, &chunks), t.text());
    }

    #[test]
    fn test_multibyte_text_reconstructs() {
        let text = "Über größe ändern. ".repeat(30);
        let t = Transcript::new(text);
        let chunks = chunk(&t, 64, 16).unwrap();
        assert_eq!(reconstruct(&t, &chunks), t.text());
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let t = sentences(40);
        let first = chunk(&t, 150, 30).unwrap();
        let second = chunk(&t, 150, 30).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_config_default_is_valid() {
        assert!(ChunkerConfig::default().validate().is_ok());
    }
}
