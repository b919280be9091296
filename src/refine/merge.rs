//! Merge engine.
//!
//! Reconciles the ordered per-chunk fragments into one Markdown document:
//! - Duplicated text at chunk boundaries is removed (exact, then fuzzy match)
//! - Repeated document titles are dropped and stray H1s demoted
//! - Failed chunks become inline placeholders in partial mode
//!
//! The engine never reorders fragments and records which output bytes came
//! from which chunk.

use crate::defaults;
use crate::error::{Result, VoxError};
use crate::refine::types::{ChunkFailure, CompletionResult, ManifestEntry, MergedDocument};

/// Maximum words compared by the fuzzy boundary match.
const FUZZY_WINDOW_WORDS: usize = 40;

/// Punctuation that may be dropped when both sides of a boundary carry it.
const JOIN_PUNCTUATION: [char; 7] = [',', ';', ':', '.', '!', '?', '…'];

/// Merge settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOptions {
    /// Shorter boundary matches are treated as coincidence.
    pub min_overlap_chars: usize,
    /// Search window, in characters, on each side of a boundary.
    pub max_overlap_chars: usize,
    /// Fraction of words allowed to differ in a fuzzy match.
    pub fuzzy_ratio: f32,
    /// Emit placeholders for failed chunks instead of failing.
    pub partial_on_failure: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            min_overlap_chars: defaults::MIN_OVERLAP_CHARS,
            max_overlap_chars: defaults::MAX_OVERLAP_CHARS,
            fuzzy_ratio: defaults::FUZZY_OVERLAP_RATIO,
            partial_on_failure: false,
        }
    }
}

/// Merges results (ordered by chunk index) into a document.
pub fn merge(results: Vec<CompletionResult>, options: &MergeOptions) -> Result<MergedDocument> {
    for (position, result) in results.iter().enumerate() {
        if result.chunk_index != position {
            return Err(VoxError::Other(format!(
                "Results out of order: position {} holds chunk {}",
                position, result.chunk_index
            )));
        }
    }

    if !options.partial_on_failure
        && let Some(err) = failure_error(&results)
    {
        return Err(err);
    }

    // A lone fragment is the whole document.
    if let [only] = results.as_slice()
        && let Ok(fragment) = &only.outcome
    {
        return Ok(MergedDocument {
            markdown: fragment.clone(),
            manifest: vec![ManifestEntry {
                chunk_index: 0,
                span: 0..fragment.len(),
            }],
            failures: Vec::new(),
        });
    }

    let title = results
        .first()
        .and_then(CompletionResult::fragment)
        .and_then(|f| leading_title(f.trim()));

    let mut doc = MergedDocument::default();
    let mut after_placeholder = false;

    for result in &results {
        let start = doc.markdown.len();
        match &result.outcome {
            Err(failure) => {
                if !doc.markdown.is_empty() {
                    doc.markdown.push_str("\n\n");
                }
                doc.markdown.push_str(&placeholder(result.chunk_index, failure));
                doc.failures.push((result.chunk_index, failure.clone()));
                after_placeholder = true;
            }
            Ok(fragment) => {
                let mut text = fragment.trim().to_string();
                if result.chunk_index > 0
                    && let Some(title) = &title
                {
                    text = normalize_headings(&text, title);
                }
                append_fragment(&mut doc.markdown, &text, after_placeholder, options);
                after_placeholder = false;
            }
        }
        doc.manifest.push(ManifestEntry {
            chunk_index: result.chunk_index,
            span: start..doc.markdown.len(),
        });
    }

    tracing::debug!(
        fragments = results.len(),
        bytes = doc.markdown.len(),
        failed = doc.failures.len(),
        "Merged fragments"
    );
    Ok(doc)
}

/// Builds the error for a run with failed chunks, or `None` if all succeeded.
///
/// Chunks that were only cancelled because another chunk failed are left out
/// unless nothing else failed.
pub fn failure_error(results: &[CompletionResult]) -> Option<VoxError> {
    let failures: Vec<(usize, ChunkFailure)> = results
        .iter()
        .filter_map(|r| r.outcome.as_ref().err().map(|f| (r.chunk_index, f.clone())))
        .collect();
    report_failures(&failures)
}

/// Same as [`failure_error`] for already collected `(chunk_index, failure)` pairs.
pub fn report_failures(failures: &[(usize, ChunkFailure)]) -> Option<VoxError> {
    let primary: Vec<&(usize, ChunkFailure)> = failures
        .iter()
        .filter(|(_, f)| *f != ChunkFailure::Cancelled)
        .collect();
    let reported: Vec<&(usize, ChunkFailure)> = if primary.is_empty() {
        failures.iter().collect()
    } else {
        primary
    };

    let (_, last) = reported.last()?;
    let failed: Vec<usize> = reported.iter().map(|(i, _)| *i).collect();
    Some(VoxError::Merge {
        range: describe_chunks(&failed),
        failed,
        source: Box::new(VoxError::from(last.clone())),
    })
}

/// Formats zero-based chunk indices as a one-based range list.
///
/// `[1]` → `"chunk 2"`, `[1, 2, 3, 5]` → `"chunks 2-4, 6"`.
pub fn describe_chunks(indices: &[usize]) -> String {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &i in indices {
        match runs.last_mut() {
            Some((_, end)) if *end + 1 == i => *end = i,
            _ => runs.push((i, i)),
        }
    }
    let parts: Vec<String> = runs
        .iter()
        .map(|&(s, e)| {
            if s == e {
                format!("{}", s + 1)
            } else {
                format!("{}-{}", s + 1, e + 1)
            }
        })
        .collect();
    let noun = if indices.len() == 1 { "chunk" } else { "chunks" };
    format!("{} {}", noun, parts.join(", "))
}

fn placeholder(chunk_index: usize, failure: &ChunkFailure) -> String {
    format!("> [chunk {} failed: {}]", chunk_index + 1, failure)
}

fn append_fragment(out: &mut String, text: &str, after_placeholder: bool, options: &MergeOptions) {
    if text.is_empty() {
        return;
    }
    if out.is_empty() {
        out.push_str(text);
        return;
    }
    if after_placeholder {
        out.push_str("\n\n");
        out.push_str(text);
        return;
    }

    let Some(cut) = find_overlap(out, text, options) else {
        out.push_str("\n\n");
        out.push_str(text);
        return;
    };

    let mut rest = &text[cut..];
    if !rest.starts_with(char::is_whitespace) {
        let prev_marks = trailing_marks(out.trim_end());
        let marks = leading_marks(rest);
        if !prev_marks.is_empty()
            && !marks.is_empty()
            && (marks == prev_marks || marks.chars().all(|c| JOIN_PUNCTUATION.contains(&c)))
        {
            rest = &rest[marks.len()..];
        }
    }

    let body = rest.trim_start();
    if body.is_empty() {
        return;
    }
    let whitespace = &rest[..rest.len() - body.len()];
    let separator = if whitespace.contains("\n\n") {
        "\n\n"
    } else if whitespace.contains('\n') {
        "\n"
    } else if whitespace.is_empty() {
        ""
    } else {
        " "
    };
    out.push_str(separator);
    out.push_str(body);
}

/// Run of non-alphanumeric, non-whitespace characters at the start.
fn leading_marks(text: &str) -> &str {
    let end = text
        .find(|c: char| c.is_alphanumeric() || c.is_whitespace())
        .unwrap_or(text.len());
    &text[..end]
}

/// Run of non-alphanumeric, non-whitespace characters at the end.
fn trailing_marks(text: &str) -> &str {
    let start = text
        .rfind(|c: char| c.is_alphanumeric() || c.is_whitespace())
        .map(|i| i + text[i..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    &text[start..]
}

// Overlap detection

/// A normalized word and the byte offset just past it in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    norm: String,
    end: usize,
}

/// Lowercased alphanumeric words; punctuation and whitespace separate words.
fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(Token {
                norm: std::mem::take(&mut current),
                end: i,
            });
        }
    }
    if !current.is_empty() {
        tokens.push(Token {
            norm: current,
            end: text.len(),
        });
    }
    tokens
}

fn normalize(text: &str) -> String {
    tokenize(text)
        .into_iter()
        .map(|t| t.norm)
        .collect::<Vec<_>>()
        .join(" ")
}

fn char_count(tokens: &[Token]) -> usize {
    tokens.iter().map(|t| t.norm.chars().count()).sum()
}

/// Finds where `next` stops repeating the end of `prev`.
///
/// Returns the byte offset in `next` just past the duplicated words.
fn find_overlap(prev: &str, next: &str, options: &MergeOptions) -> Option<usize> {
    let max = options.max_overlap_chars;

    let prev_count = prev.chars().count();
    let tail_start = prev
        .char_indices()
        .nth(prev_count.saturating_sub(max))
        .map_or(prev.len(), |(i, _)| i);
    let tail = &prev[tail_start..];
    let mut a = tokenize(tail);
    let cut_mid_word = tail_start > 0
        && prev[..tail_start]
            .chars()
            .next_back()
            .is_some_and(char::is_alphanumeric)
        && tail.starts_with(char::is_alphanumeric);
    if cut_mid_word && !a.is_empty() {
        a.remove(0);
    }

    let head_end = next.char_indices().nth(max).map_or(next.len(), |(i, _)| i);
    let mut b = tokenize(&next[..head_end]);
    if head_end < next.len()
        && next[head_end..].starts_with(char::is_alphanumeric)
        && b.last().is_some_and(|t| t.end == head_end)
    {
        b.pop();
    }

    if a.is_empty() || b.is_empty() {
        return None;
    }

    let a_words: Vec<&str> = a.iter().map(|t| t.norm.as_str()).collect();
    let b_words: Vec<&str> = b.iter().map(|t| t.norm.as_str()).collect();

    let exact = longest_border(&a_words, &b_words);
    if exact > 0 && char_count(&b[..exact]) >= options.min_overlap_chars {
        return Some(b[exact - 1].end);
    }

    let widest = a_words.len().min(b_words.len()).min(FUZZY_WINDOW_WORDS);
    for width in (1..=widest).rev() {
        let allowed = (width as f32 * options.fuzzy_ratio).floor() as usize;
        if allowed == 0 {
            break;
        }
        let a_window = &a_words[a_words.len() - width..];
        let b_window = &b_words[..width];
        if a_window.last() == b_window.last()
            && edit_distance(a_window, b_window) <= allowed
            && char_count(&b[..width]) >= options.min_overlap_chars
        {
            return Some(b[width - 1].end);
        }
    }
    None
}

/// Length of the longest suffix of `a` that equals a prefix of `b`.
fn longest_border(a: &[&str], b: &[&str]) -> usize {
    // Prefix function over b + sentinel + a; tokens are never empty.
    let seq: Vec<&str> = b
        .iter()
        .copied()
        .chain(std::iter::once(""))
        .chain(a.iter().copied())
        .collect();
    let mut pi = vec![0usize; seq.len()];
    for i in 1..seq.len() {
        let mut k = pi[i - 1];
        while k > 0 && seq[i] != seq[k] {
            k = pi[k - 1];
        }
        if seq[i] == seq[k] {
            k += 1;
        }
        pi[i] = k;
    }
    pi.last().copied().unwrap_or(0)
}

/// Levenshtein distance between two sequences.
fn edit_distance<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    let n = b.len();
    let mut prev = (0..=n).collect::<Vec<_>>();
    let mut curr = vec![0; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

// Headings

fn is_fence(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("```") || t.starts_with("~~~")
}

/// Text of a level-1 ATX heading line.
fn h1_text(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\n', '\r']);
    let rest = if line == "#" {
        ""
    } else {
        line.strip_prefix("# ")?
    };
    Some(rest.trim().trim_end_matches('#').trim())
}

/// Normalized title if the first non-blank line is an H1.
fn leading_title(text: &str) -> Option<String> {
    let first = text.lines().find(|l| !l.trim().is_empty())?;
    h1_text(first).map(normalize)
}

/// Drops a leading H1 that repeats `title` and demotes other H1s to H2.
fn normalize_headings(text: &str, title: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    let mut seen_content = false;
    let mut dropping_blank = false;

    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty();
        if blank {
            if !dropping_blank {
                out.push_str(line);
            }
            continue;
        }
        dropping_blank = false;

        if is_fence(line) {
            in_fence = !in_fence;
        } else if !in_fence && let Some(heading) = h1_text(line) {
            if !seen_content && normalize(heading) == title {
                seen_content = true;
                dropping_blank = true;
                continue;
            }
            out.push('#');
        }
        seen_content = true;
        out.push_str(line);
    }
    out
}
