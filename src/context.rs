//! Context assembly for generation.
//!
//! Retrieved chunks are rendered in rank order as
//! `Source: {filename}\nContent: {content}` blocks joined by the configured
//! separator. Blocks are added until the next one would push the estimate
//! past `max_tokens`; the first block is always kept.

use serde::Serialize;

use crate::chunk::estimate_tokens;
use crate::config::ContextConfig;
use crate::search::ScoredChunk;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AssembledContext {
    pub text: String,
    /// How many of the ranked chunks made it in, from the top.
    pub chunks_used: usize,
    pub estimated_tokens: usize,
}

/// `Source: {filename}\nContent: {content}`
pub fn render_chunk(chunk: &ScoredChunk) -> String {
    format!("Source: {}\nContent: {}", chunk.filename, chunk.content)
}

/// Concatenate rendered chunks in rank order until the next one would pass
/// `max_tokens`. At least one chunk is always used.
pub fn assemble_context(chunks: &[ScoredChunk], settings: &ContextConfig) -> AssembledContext {
    let mut blocks: Vec<String> = Vec::new();
    let mut tokens = 0usize;

    for chunk in chunks {
        let block = render_chunk(chunk);
        let block_tokens = estimate_tokens(&block);
        if !blocks.is_empty() && tokens + block_tokens > settings.max_tokens {
            break;
        }
        tokens += block_tokens;
        blocks.push(block);
    }

    AssembledContext {
        chunks_used: blocks.len(),
        text: blocks.join(&settings.separator),
        estimated_tokens: tokens,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(filename: &str, content: &str) -> ScoredChunk {
        ScoredChunk {
            chunk_id: format!("{}-chunk", filename),
            document_id: "d1".to_string(),
            filename: filename.to_string(),
            content: content.to_string(),
            sequence_number: 0,
            score: 0.9,
        }
    }

    #[test]
    fn test_format_and_separator() {
        let ctx = assemble_context(
            &[chunk("a.txt", "alpha"), chunk("b.txt", "beta")],
            &ContextConfig::default(),
        );
        assert_eq!(
            ctx.text,
            "Source: a.txt\nContent: alpha\n\n---\n\nSource: b.txt\nContent: beta"
        );
        assert_eq!(ctx.chunks_used, 2);
    }

    #[test]
    fn test_budget_stops_before_overflow() {
        let settings = ContextConfig {
            max_tokens: 20,
            ..ContextConfig::default()
        };
        // Each block is 43 chars (11 tokens); only the first fits.
        let chunks = vec![
            chunk("a.txt", &"x".repeat(20)),
            chunk("b.txt", &"y".repeat(20)),
        ];
        let ctx = assemble_context(&chunks, &settings);
        assert_eq!(ctx.chunks_used, 1);
        assert!(!ctx.text.contains("b.txt"));
    }

    #[test]
    fn test_first_chunk_always_included() {
        let settings = ContextConfig {
            max_tokens: 1,
            ..ContextConfig::default()
        };
        let ctx = assemble_context(&[chunk("big.txt", &"z".repeat(400))], &settings);
        assert_eq!(ctx.chunks_used, 1);
        assert!(ctx.estimated_tokens > 1);
    }

    #[test]
    fn test_empty_input() {
        let ctx = assemble_context(&[], &ContextConfig::default());
        assert_eq!(ctx, AssembledContext::default());
    }
}
