//! Boundary-preferring text chunker.
//!
//! Splits canonical document text into chunks bounded by a size limit,
//! with optional overlap between consecutive chunks so context survives the
//! split. Cut points prefer paragraph breaks (`\n\n`), then line breaks,
//! then sentence ends, then word boundaries, falling back to a hard cut.
//!
//! Sizes are measured in **bytes**, with every cut clamped to a UTF-8
//! character boundary, so non-ASCII chunks come out at or under the
//! configured size and a code point is never split. The exception is a
//! window narrower than a single character, which yields that one
//! character whole.

use crate::error::PipelineError;
use crate::models::{Chunk, NormalizedDocument};

/// Split a normalized document into ordered chunks.
///
/// Indices are contiguous from 0. A document shorter than `max_chars`
/// yields exactly one chunk; empty text yields none (the document is still
/// recorded as indexed, with zero vector entries).
pub fn chunk_document(
    doc: &NormalizedDocument,
    max_chars: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, PipelineError> {
    if max_chars == 0 || overlap >= max_chars {
        return Err(PipelineError::Chunking {
            id: doc.id.clone(),
            reason: format!("invalid bounds: max_chars={max_chars}, overlap={overlap}"),
        });
    }

    let text = doc.canonical_text.as_str();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let mut hard_end = floor_char_boundary(text, (start + max_chars).min(text.len()));
        // A window narrower than the character at the cursor would floor
        // back to `start`; take the whole character so the loop always
        // advances.
        if hard_end <= start {
            hard_end = ceil_char_boundary(text, start + 1);
        }
        let end = if hard_end == text.len() {
            hard_end
        } else {
            start + split_point(&text[start..hard_end])
        };

        chunks.push(Chunk {
            parent_id: doc.id.clone(),
            chunk_index: chunks.len(),
            text: text[start..end].to_string(),
            metadata: doc.metadata.clone(),
        });

        if end == text.len() {
            break;
        }

        // Step back by the overlap, but always make forward progress even
        // when a short boundary-cut chunk is smaller than the overlap.
        let next = floor_char_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }

    Ok(chunks)
}

/// Byte length of the best cut inside `window`. Boundaries in the front
/// half are ignored so chunks stay reasonably full.
fn split_point(window: &str) -> usize {
    let min_cut = window.len() / 2;

    window
        .rfind("\n\n")
        .filter(|&p| p >= min_cut)
        .map(|p| p + 2)
        .or_else(|| window.rfind('\n').filter(|&p| p >= min_cut).map(|p| p + 1))
        .or_else(|| window.rfind(". ").filter(|&p| p >= min_cut).map(|p| p + 2))
        .or_else(|| window.rfind(' ').filter(|&p| p >= min_cut).map(|p| p + 1))
        .unwrap_or(window.len())
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, i: usize) -> usize {
    let mut i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
