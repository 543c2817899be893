//! Sentence boundary scanning over multi-script terminal punctuation.

use crate::tokens::{estimate_tokens, TokenTally};

/// A trimmed sentence located inside the original text. Byte offsets index
/// the original string; char offsets are what chunk positions report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentenceSpan {
    pub byte_start: usize,
    pub byte_end: usize,
    pub char_start: usize,
    pub char_end: usize,
    pub tokens: usize,
}

fn push_trimmed(
    text: &str,
    raw_byte_start: usize,
    raw_byte_end: usize,
    raw_char_start: usize,
    out: &mut Vec<SentenceSpan>,
) {
    let raw = &text[raw_byte_start..raw_byte_end];
    let mut byte_start = raw_byte_start;
    let mut char_start = raw_char_start;
    for ch in raw.chars() {
        if !ch.is_whitespace() {
            break;
        }
        byte_start += ch.len_utf8();
        char_start += 1;
    }
    if byte_start >= raw_byte_end {
        return;
    }
    let mut byte_end = raw_byte_end;
    let mut char_end = raw_char_start + raw.chars().count();
    for ch in raw.chars().rev() {
        if !ch.is_whitespace() {
            break;
        }
        byte_end -= ch.len_utf8();
        char_end -= 1;
    }
    let tokens = estimate_tokens(&text[byte_start..byte_end]);
    out.push(SentenceSpan { byte_start, byte_end, char_start, char_end, tokens });
}

/// Splits `text` into trimmed sentence spans on terminal punctuation.
/// Any trailing remainder after the last boundary is kept as a final
/// sentence; text with no boundary at all comes back as a single span.
pub fn split_sentences(text: &str) -> Vec<SentenceSpan> {
    let mut out = Vec::new();
    let mut seg_byte_start = 0usize;
    let mut seg_char_start = 0usize;
    let mut char_idx = 0usize;
    for (byte_idx, ch) in text.char_indices() {
        if matches!(ch, '。' | '！' | '？' | '.' | '!' | '?') {
            let end = byte_idx + ch.len_utf8();
            push_trimmed(text, seg_byte_start, end, seg_char_start, &mut out);
            seg_byte_start = end;
            seg_char_start = char_idx + 1;
        }
        char_idx += 1;
    }
    push_trimmed(text, seg_byte_start, text.len(), seg_char_start, &mut out);
    out
}

/// Splits one oversized sentence into pieces of at most `max_tokens`,
/// cutting at the last whitespace before the cap where one exists.
pub(crate) fn split_oversized(
    text: &str,
    span: &SentenceSpan,
    max_tokens: usize,
) -> Vec<SentenceSpan> {
    let max_tokens = max_tokens.max(1);
    if span.tokens <= max_tokens {
        return vec![*span];
    }
    let slice = &text[span.byte_start..span.byte_end];
    let chars: Vec<(usize, char)> = slice.char_indices().collect();
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        while start < chars.len() && chars[start].1.is_whitespace() {
            start += 1;
        }
        if start >= chars.len() {
            break;
        }
        let mut tally = TokenTally::default();
        let mut last_ws: Option<usize> = None;
        let mut i = start;
        while i < chars.len() {
            let ch = chars[i].1;
            if ch.is_whitespace() {
                last_ws = Some(i);
            }
            tally.push(ch);
            if tally.estimate() > max_tokens && i > start {
                break;
            }
            i += 1;
        }
        let mut end = if i >= chars.len() {
            chars.len()
        } else {
            last_ws.unwrap_or(i)
        };
        while end > start + 1 && chars[end - 1].1.is_whitespace() {
            end -= 1;
        }
        let byte_start = span.byte_start + chars[start].0;
        let byte_end = if end < chars.len() {
            span.byte_start + chars[end].0
        } else {
            span.byte_end
        };
        let piece = &text[byte_start..byte_end];
        out.push(SentenceSpan {
            byte_start,
            byte_end,
            char_start: span.char_start + start,
            char_end: span.char_start + end,
            tokens: estimate_tokens(piece),
        });
        start = end;
    }
    out
}
