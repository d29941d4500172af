use std::collections::HashMap;
use std::sync::OnceLock;

use common::model::{Chunk, ChunkPayload, RawBlock};
use tokenizers::Tokenizer;
use tracing::warn;

/// Chunking bounds. Defaults mirror the service configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            min_tokens: 200,
            max_tokens: 400,
            overlap_tokens: 50,
        }
    }
}

/// Pretrained BPE vocabulary used for token-accurate windows. Loading can
/// fail in offline environments; chunking then degrades to whitespace
/// tokens, deterministically for identical input.
fn get_tokenizer() -> Option<&'static Tokenizer> {
    static TOKENIZER: OnceLock<Option<Tokenizer>> = OnceLock::new();

    TOKENIZER
        .get_or_init(|| match Tokenizer::from_pretrained("bert-base-cased", None) {
            Ok(tokenizer) => Some(tokenizer),
            Err(err) => {
                warn!(error = %err, "tokenizer unavailable; falling back to whitespace tokens");
                None
            }
        })
        .as_ref()
}

/// Token count of `text` under the active tokenization.
pub fn tokenize_len(text: &str) -> usize {
    match get_tokenizer() {
        Some(tokenizer) => tokenizer
            .encode(text, false)
            .map(|encoding| encoding.get_ids().len().max(1))
            .unwrap_or_else(|_| text.split_whitespace().count().max(1)),
        None => text.split_whitespace().count().max(1),
    }
}

/// Clamps the requested bounds to valid values, logging once per invocation.
fn clamp_options(options: ChunkingOptions) -> ChunkingOptions {
    let max_tokens = options.max_tokens.max(1);
    let min_tokens = options.min_tokens.min(max_tokens);
    let overlap_tokens = options.overlap_tokens.min(max_tokens.saturating_sub(1));

    let clamped = ChunkingOptions {
        min_tokens,
        max_tokens,
        overlap_tokens,
    };
    if clamped != options {
        warn!(
            requested = ?options,
            effective = ?clamped,
            "chunking bounds out of range; clamped"
        );
    }
    clamped
}

/// Splits `text` into windows of `max_tokens` tokens with stride
/// `max_tokens - overlap_tokens`, decoding each window back to text.
/// Windows shorter than `min_tokens` are dropped unless that would leave
/// nothing, in which case the single remaining window is kept.
pub fn chunk_text(text: &str, options: ChunkingOptions) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let options = clamp_options(options);
    let stride = options.max_tokens.saturating_sub(options.overlap_tokens).max(1);

    let windows: Vec<String> = match get_tokenizer() {
        Some(tokenizer) => {
            let Ok(encoding) = tokenizer.encode(text, false) else {
                return vec![text.to_string()];
            };
            let ids = encoding.get_ids();
            if ids.is_empty() {
                return Vec::new();
            }
            token_windows(ids.len(), options.max_tokens, stride)
                .into_iter()
                .filter_map(|(start, end)| {
                    let window = ids.get(start..end)?;
                    tokenizer.decode(window, true).ok().map(|s| s.trim().to_string())
                })
                .filter(|s| !s.is_empty())
                .collect()
        }
        None => {
            let words: Vec<&str> = text.split_whitespace().collect();
            token_windows(words.len(), options.max_tokens, stride)
                .into_iter()
                .filter_map(|(start, end)| words.get(start..end).map(|w| w.join(" ")))
                .collect()
        }
    };

    if windows.is_empty() {
        return Vec::new();
    }

    let kept: Vec<String> = windows
        .iter()
        .filter(|window| tokenize_len(window) >= options.min_tokens)
        .cloned()
        .collect();
    if kept.is_empty() {
        windows.into_iter().take(1).collect()
    } else {
        kept
    }
}

/// `(start, end)` spans of stride windows covering `len` positions.
fn token_windows(len: usize, max_tokens: usize, stride: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: usize = 0;
    loop {
        let end = start.saturating_add(max_tokens).min(len);
        spans.push((start, end));
        if end >= len {
            break;
        }
        start = start.saturating_add(stride);
    }
    spans
}

/// Chunks raw blocks into payload records. `chunk_index` is dense and
/// gap-free per `sha1`, even when one document arrived as multiple blocks.
pub fn chunk_payloads(blocks: &[RawBlock], options: ChunkingOptions) -> Vec<Chunk> {
    let mut next_index: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();

    for block in blocks {
        let text = block.text.trim();
        if text.is_empty() {
            continue;
        }
        for chunk_text_part in chunk_text(text, options) {
            let counter = next_index.entry(block.meta.sha1.clone()).or_insert(0);
            let token_len = tokenize_len(&chunk_text_part);
            out.push(Chunk {
                text: chunk_text_part,
                payload: ChunkPayload {
                    source_file: block.meta.source_file.clone(),
                    sha1: block.meta.sha1.clone(),
                    chunk_index: *counter,
                    token_len,
                    page_no: block.meta.page_no,
                },
            });
            *counter = counter.saturating_add(1);
        }
    }

    out
}

/// Last-resort split used by the miner when neighbor evidence needs at least
/// two chunks: halve the text on whitespace.
pub fn force_split_in_two(block: &RawBlock) -> Vec<Chunk> {
    let words: Vec<&str> = block.text.split_whitespace().collect();
    let parts: Vec<String> = if words.len() > 1 {
        let mid = (words.len() / 2).max(1);
        let (head, tail) = words.split_at(mid);
        vec![head.join(" "), tail.join(" ")]
    } else {
        // Degenerate input: duplicate so neighbor refs stay demonstrable.
        vec![block.text.clone(), block.text.clone()]
    };

    parts
        .into_iter()
        .enumerate()
        .map(|(chunk_index, text)| {
            let token_len = text.split_whitespace().count().max(1);
            Chunk {
                payload: ChunkPayload {
                    source_file: block.meta.source_file.clone(),
                    sha1: block.meta.sha1.clone(),
                    chunk_index,
                    token_len,
                    page_no: block.meta.page_no,
                },
                text,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::model::BlockMeta;

    fn block(text: &str, sha1: &str) -> RawBlock {
        RawBlock {
            text: text.to_string(),
            meta: BlockMeta {
                source_file: "doc.txt".to_string(),
                content_type: "text/plain".to_string(),
                sha1: sha1.to_string(),
                page_no: None,
                created_at: Utc::now(),
            },
        }
    }

    fn words(n: usize) -> String {
        (0..n).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn chunk_indexes_are_dense_per_sha1() {
        let blocks = vec![block(&words(40), "aaa"), block(&words(40), "aaa")];
        let chunks = chunk_payloads(
            &blocks,
            ChunkingOptions {
                min_tokens: 1,
                max_tokens: 8,
                overlap_tokens: 1,
            },
        );

        let mut indices: Vec<usize> = chunks
            .iter()
            .filter(|c| c.payload.sha1 == "aaa")
            .map(|c| c.payload.chunk_index)
            .collect();
        indices.sort_unstable();
        let expected: Vec<usize> = (0..indices.len()).collect();
        assert_eq!(indices, expected);
    }

    #[test]
    fn zero_overlap_windows_cover_all_tokens() {
        let text = words(20);
        let chunks = chunk_text(
            &text,
            ChunkingOptions {
                min_tokens: 1,
                max_tokens: 5,
                overlap_tokens: 0,
            },
        );
        // Round trip: with overlap 0 the concatenated windows restore the
        // original text modulo whitespace.
        let strip = |s: &str| -> String { s.chars().filter(|c| !c.is_whitespace()).collect() };
        let rejoined = strip(&chunks.join(" "));
        assert_eq!(rejoined, strip(&text));
    }

    #[test]
    fn overlapping_windows_share_tokens() {
        let text = words(16);
        let chunks = chunk_text(
            &text,
            ChunkingOptions {
                min_tokens: 1,
                max_tokens: 8,
                overlap_tokens: 4,
            },
        );
        assert!(chunks.len() >= 2, "expected at least two windows");
    }

    #[test]
    fn short_text_yields_single_chunk() {
        let chunks = chunk_text("tiny text", ChunkingOptions::default());
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn invalid_bounds_are_clamped_not_fatal() {
        let chunks = chunk_text(
            &words(12),
            ChunkingOptions {
                min_tokens: 50,
                max_tokens: 10,
                overlap_tokens: 99,
            },
        );
        assert!(!chunks.is_empty());
    }

    #[test]
    fn force_split_always_yields_two_chunks() {
        let halves = force_split_in_two(&block("alpha beta gamma delta", "bbb"));
        assert_eq!(halves.len(), 2);
        assert_eq!(halves.first().map(|c| c.payload.chunk_index), Some(0));
        assert_eq!(halves.get(1).map(|c| c.payload.chunk_index), Some(1));

        let degenerate = force_split_in_two(&block("single", "ccc"));
        assert_eq!(degenerate.len(), 2);
    }

    #[test]
    fn empty_text_produces_no_chunks() {
        assert!(chunk_text("   ", ChunkingOptions::default()).is_empty());
        assert!(chunk_payloads(&[block("", "ddd")], ChunkingOptions::default()).is_empty());
    }
}
