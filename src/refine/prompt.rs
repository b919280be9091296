//! Prompt builder.
//!
//! Pure functions that turn a chunk and its continuity context into a
//! [`CompletionRequest`]. No I/O happens here.

use crate::defaults;
use crate::refine::types::{Chunk, CompletionRequest};

/// Context handed to the model so it can continue where the previous part ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity<'a> {
    /// No context (first chunk, or overlap disabled).
    None,
    /// Tail of the previous refined fragment (strict continuity).
    PriorFragmentTail(&'a str),
    /// Raw overlap text shared with the previous chunk.
    RawOverlap(&'a str),
}

/// Builds completion requests for one run.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    format: String,
    memory: Option<String>,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new(defaults::DEFAULT_FORMAT)
    }
}

impl PromptBuilder {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            memory: None,
        }
    }

    /// Appends a rendered memory block to every system prompt.
    pub fn with_memory(mut self, memory: Option<String>) -> Self {
        self.memory = memory.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Builds the request for `chunk`.
    pub fn build(
        &self,
        chunk: &Chunk,
        chunk_text: &str,
        context: Continuity<'_>,
        is_first: bool,
        is_last: bool,
    ) -> CompletionRequest {
        CompletionRequest {
            chunk_index: chunk.index,
            system: self.system_prompt(chunk.index, context, is_first, is_last),
            prompt: user_prompt(chunk_text, context),
            is_first,
            is_last,
        }
    }

    fn system_prompt(
        &self,
        index: usize,
        context: Continuity<'_>,
        is_first: bool,
        is_last: bool,
    ) -> String {
        let mut system = format!(
            "You are VoxCompose, a local note refiner. Output {} with clear structure. \
             Use headings, bullets, short paragraphs. Preserve meaning; fix disfluencies.",
            self.format
        );

        if !(is_first && is_last) {
            system.push_str(&format!(
                "\n\nThis is part {} of a longer transcript that is refined in pieces.",
                index + 1
            ));
            if !is_first {
                system.push_str(
                    " Continue the document: do not open with a new top-level (#) heading.",
                );
            }
            if !is_last {
                system.push_str(" Do not add a closing summary; more text follows.");
            }
        }

        if !matches!(context, Continuity::None) {
            system.push_str(
                "\n\nThe context section shows what comes right before this part. \
                 Do not repeat content from it; refine only the transcript section.",
            );
        }

        system.push_str(&format!(
            "\n\nOutput only the refined {}, without commentary.",
            self.format
        ));

        if let Some(memory) = &self.memory {
            system.push_str("\n\n");
            system.push_str(memory);
        }
        system
    }
}

fn user_prompt(chunk_text: &str, context: Continuity<'_>) -> String {
    match context {
        Continuity::None => chunk_text.to_string(),
        Continuity::PriorFragmentTail(tail) => format!(
            "Context (end of the already refined previous part):\n{}\n\nTranscript:\n{}",
            tail, chunk_text
        ),
        Continuity::RawOverlap(overlap) => format!(
            "Context (raw transcript shared with the previous part):\n{}\n\nTranscript:\n{}",
            overlap, chunk_text
        ),
    }
}

/// Returns roughly the last `max_chars` characters of `text`, starting on a
/// word boundary when the cut would split a word.
pub fn tail(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let cut = text
        .char_indices()
        .nth(total - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let rest = &text[cut..];
    let starts_mid_word = text[..cut]
        .chars()
        .next_back()
        .is_some_and(|c| !c.is_whitespace());
    if starts_mid_word {
        match rest.find(char::is_whitespace) {
            Some(ws) => rest[ws..].trim_start(),
            None => rest,
        }
    } else {
        rest
    }
}
