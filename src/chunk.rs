//! Token-bounded text chunker.
//!
//! Splits cleaned document text into [`ChunkDraft`]s according to a
//! [`ChunkingConfig`] resolved for the owning tenant. Sizes are configured
//! in tokens and converted at a fixed chars-per-token ratio; offsets are
//! character offsets into the input text.
//!
//! Three strategies are supported:
//!
//! - **FIXED_SIZE**: windows of exactly `S` chars advancing by `S - O`. For
//!   text of length `L` this yields `1` chunk when `L <= S`, otherwise
//!   `ceil((L - O) / (S - O))`.
//! - **SLIDING_WINDOW**: the same stride, but window edges snap to
//!   whitespace so no word is cut in half.
//! - **SEMANTIC**: sentences are packed into chunks of at most `S` chars;
//!   the trailing sentences of each chunk (up to `O` chars) seed the next.
//!
//! Sequence numbers are always `0..n` with no gaps.

use sha2::{Digest, Sha256};

use crate::config::{ChunkStrategy, ChunkingConfig};

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// A chunk produced by the splitter, before it is given an id and stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub sequence_number: i64,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_count: usize,
    pub content_hash: String,
}

/// `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split text into chunks. Whitespace-only input yields no chunks.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<ChunkDraft> {
    let chars: Vec<char> = text.chars().collect();
    if chars.iter().all(|c| c.is_whitespace()) {
        return Vec::new();
    }

    let size_tokens = config.chunk_size.max(1);
    let overlap_tokens = config.overlap.min(size_tokens - 1);
    let size = size_tokens * CHARS_PER_TOKEN;
    let overlap = overlap_tokens * CHARS_PER_TOKEN;

    let spans = match config.strategy {
        ChunkStrategy::FixedSize => fixed_spans(chars.len(), size, overlap),
        ChunkStrategy::SlidingWindow => word_aligned_spans(&chars, size, overlap),
        ChunkStrategy::Semantic => semantic_spans(&chars, size, overlap),
    };

    spans
        .into_iter()
        .enumerate()
        .map(|(i, (start, end))| make_draft(i as i64, &chars, start, end))
        .collect()
}

fn make_draft(sequence_number: i64, chars: &[char], start: usize, end: usize) -> ChunkDraft {
    let content: String = chars[start..end].iter().collect();
    ChunkDraft {
        sequence_number,
        token_count: (end - start).div_ceil(CHARS_PER_TOKEN),
        content_hash: content_hash(&content),
        content,
        start_offset: start,
        end_offset: end,
    }
}

fn fixed_spans(len: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let step = size - overlap;
    let mut spans = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(len);
        spans.push((start, end));
        if end >= len {
            break;
        }
        start += step;
    }
    spans
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn trim_end(chars: &[char], start: usize, mut end: usize) -> usize {
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    end
}

fn word_aligned_spans(chars: &[char], size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let len = chars.len();
    let mut spans = Vec::new();
    let mut start = skip_whitespace(chars, 0);

    while start < len {
        let mut end = (start + size).min(len);
        if end < len && !chars[end].is_whitespace() {
            // Back off to the last break inside the window; a single word
            // longer than the window is cut hard.
            if let Some(ws) = (start + 1..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws;
            }
        }
        spans.push((start, trim_end(chars, start, end)));
        if end >= len {
            break;
        }

        let mut next = end.saturating_sub(overlap).max(start + 1);
        while next < end && !chars[next - 1].is_whitespace() {
            next += 1;
        }
        start = skip_whitespace(chars, next);
    }
    spans
}

/// Sentence spans: terminal punctuation followed by whitespace, or a blank
/// line, ends a sentence. Spans never start or end on whitespace.
fn sentence_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;

    for i in 0..chars.len() {
        let c = chars[i];
        let s = match start {
            Some(s) => s,
            None if c.is_whitespace() => continue,
            None => {
                start = Some(i);
                i
            }
        };
        let terminal = matches!(c, '.' | '!' | '?')
            && chars.get(i + 1).map_or(true, |next| next.is_whitespace());
        let paragraph_break = c == '\n' && chars.get(i + 1) == Some(&'\n');
        if terminal {
            spans.push((s, i + 1));
            start = None;
        } else if paragraph_break {
            spans.push((s, trim_end(chars, s, i)));
            start = None;
        }
    }
    if let Some(s) = start {
        spans.push((s, trim_end(chars, s, chars.len())));
    }
    spans
}

fn semantic_spans(chars: &[char], size: usize, overlap: usize) -> Vec<(usize, usize)> {
    // Sentences longer than a whole chunk are cut into window-sized pieces.
    let mut sentences = Vec::new();
    for (s, e) in sentence_spans(chars) {
        let mut pos = s;
        while e - pos > size {
            let cut = trim_end(chars, pos, pos + size);
            sentences.push((pos, cut));
            pos = skip_whitespace(chars, pos + size);
        }
        if pos < e {
            sentences.push((pos, e));
        }
    }

    let mut spans = Vec::new();
    let mut current: Vec<(usize, usize)> = Vec::new();

    for sentence in sentences {
        if let (Some(first), Some(last)) = (current.first().copied(), current.last().copied()) {
            if sentence.1 - first.0 > size {
                spans.push((first.0, last.1));

                let carried = current
                    .iter()
                    .rev()
                    .take_while(|(s, _)| last.1 - *s <= overlap)
                    .count();
                current.drain(..current.len() - carried);
                if current
                    .first()
                    .is_some_and(|(s, _)| sentence.1 - *s > size)
                {
                    current.clear();
                }
            }
        }
        current.push(sentence);
    }
    if let (Some(first), Some(last)) = (current.first(), current.last()) {
        spans.push((first.0, last.1));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: ChunkStrategy, chunk_size: usize, overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            strategy,
            chunk_size,
            overlap,
        }
    }

    fn prose(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("Sentence number {} talks about topic {}.", i, i % 7))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        for strategy in [
            ChunkStrategy::FixedSize,
            ChunkStrategy::Semantic,
            ChunkStrategy::SlidingWindow,
        ] {
            assert!(chunk_text("", &config(strategy, 10, 2)).is_empty());
            assert!(chunk_text("  \n\n ", &config(strategy, 10, 2)).is_empty());
        }
    }

    #[test]
    fn test_short_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", &config(ChunkStrategy::FixedSize, 512, 64));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence_number, 0);
        assert_eq!(chunks[0].content, "Hello, world!");
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 13);
        assert_eq!(chunks[0].token_count, 4);
    }

    #[test]
    fn test_fixed_size_chunk_count_formula() {
        // S = 10 tokens (40 chars), O = 2 tokens (8 chars).
        let cfg = config(ChunkStrategy::FixedSize, 10, 2);
        let (s, o) = (40usize, 8usize);
        for len in 1..=400usize {
            let text: String = "x".repeat(len);
            let expected = if len <= s {
                1
            } else {
                (len - o).div_ceil(s - o)
            };
            assert_eq!(
                chunk_text(&text, &cfg).len(),
                expected,
                "wrong chunk count for L={}",
                len
            );
        }
    }

    #[test]
    fn test_fixed_size_windows_overlap() {
        let text: String = ('a'..='z').cycle().take(100).collect();
        let chunks = chunk_text(&text, &config(ChunkStrategy::FixedSize, 10, 2));
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, 40);
        assert_eq!(chunks[1].start_offset, 32);
        assert_eq!(chunks.last().unwrap().end_offset, 100);
    }

    #[test]
    fn test_sequence_numbers_contiguous() {
        let text = prose(80);
        for strategy in [
            ChunkStrategy::FixedSize,
            ChunkStrategy::Semantic,
            ChunkStrategy::SlidingWindow,
        ] {
            let chunks = chunk_text(&text, &config(strategy, 20, 4));
            assert!(chunks.len() > 1, "{:?} produced a single chunk", strategy);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.sequence_number, i as i64, "{:?} gap at {}", strategy, i);
            }
        }
    }

    #[test]
    fn test_offsets_match_content() {
        let text = format!("Überblick: {}\n\nZweiter Absatz. {}", prose(10), prose(10));
        let chars: Vec<char> = text.chars().collect();
        for strategy in [
            ChunkStrategy::FixedSize,
            ChunkStrategy::Semantic,
            ChunkStrategy::SlidingWindow,
        ] {
            for c in chunk_text(&text, &config(strategy, 16, 4)) {
                let slice: String = chars[c.start_offset..c.end_offset].iter().collect();
                assert_eq!(slice, c.content);
                assert_eq!(c.content_hash, content_hash(&c.content));
            }
        }
    }

    #[test]
    fn test_sliding_window_keeps_words_whole() {
        let text = prose(40);
        let words: std::collections::HashSet<&str> = text.split_whitespace().collect();
        for c in chunk_text(&text, &config(ChunkStrategy::SlidingWindow, 12, 3)) {
            for w in c.content.split_whitespace() {
                assert!(words.contains(w), "split word '{}'", w);
            }
            assert!(c.content.chars().count() <= 48);
        }
    }

    #[test]
    fn test_sliding_window_overlaps() {
        let text = prose(40);
        let chunks = chunk_text(&text, &config(ChunkStrategy::SlidingWindow, 12, 3));
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset < pair[0].end_offset);
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
    }

    #[test]
    fn test_semantic_chunks_end_on_sentences() {
        let text = prose(30);
        let chunks = chunk_text(&text, &config(ChunkStrategy::Semantic, 30, 10));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.ends_with('.'), "chunk does not end a sentence: {}", c.content);
            assert!(c.content.chars().count() <= 120);
        }
        // Each chunk after the first repeats the previous chunk's last sentence.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset < pair[0].end_offset);
        }
    }

    #[test]
    fn test_semantic_splits_oversized_sentence() {
        let text = format!("{} end.", "word ".repeat(100));
        let chunks = chunk_text(&text, &config(ChunkStrategy::Semantic, 10, 2));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.content.chars().count() <= 40);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = prose(25);
        let cfg = config(ChunkStrategy::Semantic, 20, 5);
        assert_eq!(chunk_text(&text, &cfg), chunk_text(&text, &cfg));
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
