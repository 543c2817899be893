//! Token-aware chunking with sentence-boundary preservation.
//!
//! Field text is split on terminal punctuation (multi-script), sentences are
//! accumulated up to a target token budget, and each closed chunk seeds the
//! next with a trailing-sentence overlap. Chunks are contiguous slices of
//! the original text.

pub mod sentence;
pub mod tokens;

use serde::{Deserialize, Serialize};
use vector_model::ChunkingParams;

use crate::sentence::{split_oversized, split_sentences, SentenceSpan};
use crate::tokens::estimate_tokens;

/// A token-bounded slice of a field's text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Dense 0-based order within the field.
    pub index: u32,
    pub text: String,
    /// Char offset of the chunk start in the original text.
    pub start_position: usize,
    /// Char offset one past the chunk end in the original text.
    pub end_position: usize,
    /// Token estimate of `text`, taken on the joined slice rather than
    /// summed from per-sentence estimates.
    pub token_count: usize,
}

/// Splits `text` into sentence-aligned chunks bounded by `params`.
///
/// Blank input yields no chunks. Text whose total estimate is at or under
/// `min_tokens` yields exactly one chunk spanning the trimmed input.
pub fn chunk_text(text: &str, params: &ChunkingParams) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let total = estimate_tokens(trimmed);
    if total <= params.min_tokens {
        let start = leading_char_offset(text);
        return vec![Chunk {
            index: 0,
            text: trimmed.to_string(),
            start_position: start,
            end_position: start + trimmed.chars().count(),
            token_count: total,
        }];
    }

    let target = params.target_tokens_per_chunk.max(1);
    let max = params.max_tokens_per_chunk.max(target);
    let mut sentences: Vec<SentenceSpan> = Vec::new();
    for span in split_sentences(text) {
        if span.tokens > max {
            sentences.extend(split_oversized(text, &span, max));
        } else {
            sentences.push(span);
        }
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<SentenceSpan> = Vec::new();
    let mut current_tokens = 0usize;
    // Sentences at the head of `current` carried over as overlap; a chunk
    // closes only once it holds at least one sentence beyond them.
    let mut carried = 0usize;
    for span in sentences {
        let closes = current.len() > carried && current_tokens + span.tokens > target;
        if closes {
            chunks.push(join_chunk(text, &current, chunks.len() as u32));
            let overlap = overlap_suffix(&current, params.overlap_tokens);
            carried = overlap.len();
            current_tokens = overlap.iter().map(|s| s.tokens).sum();
            current = overlap;
        }
        current_tokens += span.tokens;
        current.push(span);
    }
    if current.len() > carried {
        chunks.push(join_chunk(text, &current, chunks.len() as u32));
    }
    chunks
}

fn leading_char_offset(text: &str) -> usize {
    text.chars().take_while(|ch| ch.is_whitespace()).count()
}

/// Materializes one chunk from a run of contiguous sentence spans. The token
/// count is re-estimated on the joined slice.
fn join_chunk(text: &str, spans: &[SentenceSpan], index: u32) -> Chunk {
    let first = &spans[0];
    let last = &spans[spans.len() - 1];
    let chunk_text = &text[first.byte_start..last.byte_end];
    Chunk {
        index,
        text: chunk_text.to_string(),
        start_position: first.char_start,
        end_position: last.char_end,
        token_count: estimate_tokens(chunk_text),
    }
}

/// Trailing sentences of a just-closed chunk, taken from the tail until
/// `overlap_tokens` is met or exceeded.
fn overlap_suffix(spans: &[SentenceSpan], overlap_tokens: usize) -> Vec<SentenceSpan> {
    if overlap_tokens == 0 {
        return Vec::new();
    }
    let mut acc = 0usize;
    let mut suffix: Vec<SentenceSpan> = Vec::new();
    for span in spans.iter().rev() {
        if acc >= overlap_tokens {
            break;
        }
        suffix.push(*span);
        acc += span.tokens;
    }
    suffix.reverse();
    suffix
}
