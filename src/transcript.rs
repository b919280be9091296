//! Transcript model.
//!
//! A [`Transcript`] is the raw speech-to-text output split into segments
//! (sentences or lines). Segment concatenation is exactly the input text, so
//! chunk boundaries chosen on segments never lose or invent characters.
//!
//! All positions are measured in characters (Unicode scalar values), not bytes.

use crate::error::Result;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

/// Characters that end a sentence when followed by whitespace.
const SENTENCE_TERMINATORS: [char; 4] = ['.', '!', '?', '…'];

/// Closing characters allowed between a terminator and the whitespace.
const TRAILING_CLOSERS: [char; 6] = ['"', '\'', ')', ']', '”', '’'];

/// Immutable transcript with segment boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    text: String,
    /// Segment ranges in characters, contiguous and covering the whole text.
    segments: Vec<Range<usize>>,
    /// Byte offset of every character, plus one trailing entry for `text.len()`.
    byte_offsets: Vec<usize>,
}

impl Transcript {
    /// Builds a transcript and segments it on sentence and line boundaries.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let byte_offsets = byte_offsets(&text);
        let segments = segment(&text);
        Self {
            text,
            segments,
            byte_offsets,
        }
    }

    /// Builds a transcript from pre-split segments.
    ///
    /// Empty segments are ignored.
    pub fn from_segments<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut text = String::new();
        let mut segments = Vec::new();
        let mut start = 0;
        for part in parts {
            let part = part.as_ref();
            let len = part.chars().count();
            if len == 0 {
                continue;
            }
            text.push_str(part);
            segments.push(start..start + len);
            start += len;
        }
        let byte_offsets = byte_offsets(&text);
        Self {
            text,
            segments,
            byte_offsets,
        }
    }

    /// Full transcript text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Length in characters.
    pub fn len(&self) -> usize {
        self.byte_offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Segment ranges in characters.
    pub fn segments(&self) -> &[Range<usize>] {
        &self.segments
    }

    /// Returns the text of the character range `[start, end)`.
    ///
    /// Out-of-range bounds are clamped to the transcript length.
    pub fn slice(&self, start: usize, end: usize) -> &str {
        let len = self.len();
        let end = end.min(len);
        let start = start.min(end);
        &self.text[self.byte_offsets[start]..self.byte_offsets[end]]
    }
}

fn byte_offsets(text: &str) -> Vec<usize> {
    let mut offsets: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    offsets.push(text.len());
    offsets
}

/// Splits text into segments.
///
/// A segment ends after a newline, or after a sentence terminator (optionally
/// followed by closing quotes or brackets) that is followed by whitespace. The
/// whitespace run after a boundary belongs to the segment it terminates.
fn segment(text: &str) -> Vec<Range<usize>> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let boundary = if c == '\n' {
            Some(i + 1)
        } else if SENTENCE_TERMINATORS.contains(&c) {
            let mut j = i + 1;
            while j < chars.len() && TRAILING_CLOSERS.contains(&chars[j]) {
                j += 1;
            }
            (j < chars.len() && chars[j].is_whitespace()).then_some(j)
        } else {
            None
        };

        match boundary {
            Some(mut end) => {
                while end < chars.len() && chars[end].is_whitespace() {
                    end += 1;
                }
                segments.push(start..end);
                start = end;
                i = end;
            }
            None => i += 1,
        }
    }

    if start < chars.len() {
        segments.push(start..chars.len());
    }
    segments
}

/// Reads the transcript source: a file path, or stdin when `None` or `-`.
pub fn read_source(path: Option<&Path>) -> Result<String> {
    match path {
        Some(p) if p != Path::new("-") => Ok(std::fs::read_to_string(p)?),
        _ => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}
