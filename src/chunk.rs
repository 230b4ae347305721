//! Deterministic character-based Markdown chunker.
//!
//! Splits a document's converted Markdown into an ordered sequence of
//! [`Chunk`]s, preferring to break at paragraph boundaries, then sentence
//! boundaries, then lines, then spaces, falling back to a hard cut only when
//! none of those exist nearby. The same `(text, params)` pair always produces
//! byte-identical chunks: there is no randomness and no wall-clock dependency.
//!
//! Positions and line numbers are tracked exactly, so `markdown[pos..pos+len]
//! == chunk.text` always holds — chunk text is never trimmed, which keeps
//! indented code fences intact.

use crate::lang::detect_language;
use crate::models::Chunk;

/// Approximate chars-per-token ratio used to convert a token budget into a
/// character budget.
const CHARS_PER_TOKEN: usize = 4;

/// Minimum `max_tokens` accepted; smaller values are clamped up to avoid
/// degenerate one-character chunks.
const MIN_MAX_TOKENS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub max_tokens: usize,
    pub overlap_percent: f64,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            overlap_percent: 0.15,
        }
    }
}

impl ChunkParams {
    fn clamped(self) -> Self {
        Self {
            max_tokens: self.max_tokens.max(MIN_MAX_TOKENS),
            overlap_percent: self.overlap_percent.clamp(0.0, 0.5),
        }
    }
}

/// A byte-index line table supporting O(log n) position → line lookups.
struct LineIndex {
    /// Byte offset of the start of each line (line 0 starts at offset 0).
    starts: Vec<usize>,
}

impl LineIndex {
    fn build(text: &str) -> Self {
        let mut starts = vec![0usize];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                starts.push(i + 1);
            }
        }
        Self { starts }
    }

    /// 1-based line number containing byte offset `pos`.
    fn line_at(&self, pos: usize) -> i64 {
        match self.starts.binary_search(&pos) {
            Ok(idx) => (idx + 1) as i64,
            Err(idx) => idx as i64, // idx-1+1: the line that starts before pos
        }
    }
}

/// Split `markdown` into an ordered sequence of chunks.
///
/// Empty or whitespace-only input returns an empty sequence. `doc_language`
/// overrides the per-chunk language detector when the caller already knows
/// the document's language (e.g. from a collection's configured hint).
pub fn chunk_markdown(
    markdown: &str,
    params: ChunkParams,
    doc_language: Option<&str>,
) -> Vec<Chunk> {
    if markdown.trim().is_empty() {
        return Vec::new();
    }

    let params = params.clamped();
    let max_chars = params.max_tokens * CHARS_PER_TOKEN;
    let overlap_chars = ((max_chars as f64) * params.overlap_percent).floor() as usize;
    let window = ((max_chars as f64) * 0.1).floor() as usize;

    let bytes = markdown.as_bytes();
    let len = bytes.len();
    let line_index = LineIndex::build(markdown);

    let mut chunks = Vec::new();
    let mut pos = 0usize;
    let mut seq = 0i64;

    while pos < len {
        let target_end = pos + max_chars;
        let end = if target_end >= len {
            len
        } else {
            find_break_point(markdown, pos, target_end, window)
        };

        // `end` must land on a char boundary; walk forward defensively.
        let end = next_char_boundary(markdown, end.max(pos + 1).min(len));

        let text = &markdown[pos..end];
        let start_line = line_index.line_at(pos);
        let end_line = line_index.line_at(end.saturating_sub(1).max(pos));

        let language = doc_language
            .map(|s| s.to_string())
            .or_else(|| detect_language(text));

        chunks.push(Chunk {
            mirror_hash: String::new(),
            seq,
            pos: pos as i64,
            text: text.to_string(),
            start_line,
            end_line,
            language,
            token_count: Some((text.chars().count() / CHARS_PER_TOKEN.max(1)) as i64),
        });

        seq += 1;
        let next_pos = end.saturating_sub(overlap_chars);
        pos = next_pos.max(pos + 1);
    }

    chunks
}

fn next_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx < s.len() && !s.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

fn prev_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Search `[target-window, target+window]` (clamped to `[from, text.len()]`)
/// for the best break point, in preference order: paragraph break, sentence
/// terminator, single newline, space, else exactly `target`.
fn find_break_point(text: &str, from: usize, target: usize, window: usize) -> usize {
    let len = text.len();
    let lo = prev_char_boundary(text, target.saturating_sub(window).max(from));
    let hi = next_char_boundary(text, (target + window).min(len));
    let search_region = &text[lo..hi];

    if let Some(p) = search_region.rfind("\n\n") {
        return lo + p + 2;
    }

    if let Some(p) = find_last_sentence_terminator(search_region) {
        return lo + p;
    }

    if let Some(p) = search_region.rfind('\n') {
        return lo + p + 1;
    }

    if let Some(p) = search_region.rfind(' ') {
        return lo + p + 1;
    }

    next_char_boundary(text, target)
}

/// Find the byte offset just after the last `[.!?]` in `region` that is
/// followed by whitespace and then an uppercase letter (or end of region).
fn find_last_sentence_terminator(region: &str) -> Option<usize> {
    let chars: Vec<(usize, char)> = region.char_indices().collect();
    let mut best: Option<usize> = None;

    for i in 0..chars.len() {
        let (byte_idx, c) = chars[i];
        if c != '.' && c != '!' && c != '?' {
            continue;
        }
        let after_terminator = byte_idx + c.len_utf8();

        // Must be followed by whitespace.
        let Some(&(ws_idx, ws)) = chars.get(i + 1) else {
            continue;
        };
        if !ws.is_whitespace() {
            continue;
        }
        let _ = ws_idx;

        // And then an uppercase letter, or nothing more to check.
        let ends_here = match chars.get(i + 2) {
            Some(&(_, next_c)) => next_c.is_uppercase(),
            None => true,
        };

        if ends_here {
            best = Some(after_terminator);
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_markdown("", ChunkParams::default(), None).is_empty());
        assert!(chunk_markdown("   \n\n  ", ChunkParams::default(), None).is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let chunks = chunk_markdown("# Hello World", ChunkParams::default(), None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "# Hello World");
        assert_eq!(chunks[0].pos, 0);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
    }

    #[test]
    fn chunk_text_matches_source_slice_exactly() {
        let text = "Paragraph one is here.\n\nParagraph two follows after a break.\n\nAnd a third one to round it out.";
        let params = ChunkParams {
            max_tokens: 10,
            overlap_percent: 0.1,
        };
        let chunks = chunk_markdown(text, params, None);
        for c in &chunks {
            let pos = c.pos as usize;
            let slice = &text[pos..pos + c.text.len()];
            assert_eq!(slice, c.text);
        }
    }

    #[test]
    fn positions_are_strictly_increasing() {
        let text = "Word ".repeat(2000);
        let params = ChunkParams {
            max_tokens: 800,
            overlap_percent: 0.15,
        };
        let chunks = chunk_markdown(&text, params, None);
        assert!(chunks.len() >= 3);
        for w in chunks.windows(2) {
            assert!(w[1].pos > w[0].pos);
        }
    }

    #[test]
    fn adjacent_chunks_overlap_when_configured() {
        let text = "Word ".repeat(2000);
        let params = ChunkParams {
            max_tokens: 800,
            overlap_percent: 0.15,
        };
        let chunks = chunk_markdown(&text, params, None);
        for w in chunks.windows(2) {
            let prev_end = w[0].pos as usize + w[0].text.len();
            assert!((w[1].pos as usize) < prev_end);
        }
    }

    #[test]
    fn is_deterministic() {
        let text = "Alpha.\n\nBeta.\n\nGamma.\n\nDelta.".repeat(50);
        let params = ChunkParams::default();
        let a = chunk_markdown(&text, params, None);
        let b = chunk_markdown(&text, params, None);
        assert_eq!(a, b);
    }

    #[test]
    fn line_numbers_track_newlines() {
        let text = "line one\nline two\nline three\n";
        let chunks = chunk_markdown(text, ChunkParams::default(), None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn prefers_paragraph_break_over_sentence_break() {
        let text = format!(
            "{}\n\n{}",
            "A. ".repeat(20),
            "Second paragraph follows with more content padding it out nicely."
        );
        let params = ChunkParams {
            max_tokens: 20,
            overlap_percent: 0.0,
        };
        let chunks = chunk_markdown(&text, params, None);
        // first chunk should end right at the paragraph break, not mid-sentence-run
        assert!(chunks[0].text.ends_with("\n\n") || chunks[0].text.ends_with('.'));
    }
}
