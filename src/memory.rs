//! Preference and glossary memory.
//!
//! A JSONL file where each line is `{"text": "...", "kind": "...", "ts": "..."}`.
//! The most recent items are rendered into a block appended to the system
//! instructions so the model spells names and terms the way the user wants.

use crate::error::Result;
use serde::Deserialize;
use std::fs;
use std::path::Path;

const MEMORY_HEADER: &str =
    "Incorporate these user preferences/glossary items when appropriate (do not hallucinate):";

/// One remembered preference or glossary term.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MemoryItem {
    pub text: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub ts: Option<String>,
}

fn default_kind() -> String {
    "unknown".to_string()
}

/// Reads the last `max_items` usable entries of a memory file.
///
/// A missing file yields no items. Blank lines, malformed JSON and entries
/// with empty text are skipped.
pub fn load_items(path: &Path, max_items: usize) -> Result<Vec<MemoryItem>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "memory file not found");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let recent = &lines[lines.len().saturating_sub(max_items)..];

    let items = recent
        .iter()
        .filter_map(|line| match serde_json::from_str::<MemoryItem>(line) {
            Ok(item) if !item.text.trim().is_empty() => Some(item),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(error = %e, "skipping malformed memory line");
                None
            }
        })
        .collect();
    Ok(items)
}

/// Renders items as the block appended to the system instructions.
pub fn render(items: &[MemoryItem]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    let mut out = String::from(MEMORY_HEADER);
    out.push('\n');
    for item in items {
        out.push_str("- ");
        out.push_str(item.text.trim());
        out.push('\n');
    }
    Some(out)
}

/// Loads and renders memory in one step.
pub fn build_memory_prompt(path: &Path, max_items: usize) -> Result<(Option<String>, usize)> {
    let items = load_items(path, max_items)?;
    Ok((render(&items), items.len()))
}
