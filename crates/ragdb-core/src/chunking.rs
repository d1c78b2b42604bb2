use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{DocumentChunk, SourceOffset};

/// Window policy. Tokens are whitespace-separated words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub window_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self { window_tokens: 256, overlap_tokens: 32 }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_tokens == 0 {
            return Err(Error::InvalidConfig("chunking.window_tokens must be > 0".into()));
        }
        if self.overlap_tokens >= self.window_tokens {
            return Err(Error::InvalidConfig(format!(
                "chunking.overlap_tokens ({}) must be smaller than window_tokens ({})",
                self.overlap_tokens, self.window_tokens
            )));
        }
        Ok(())
    }
}

/// Splits source text into overlapping fixed-size token windows.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkingConfig,
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkingConfig { self.config }

    /// Chunk `text` belonging to `source_id`. Each chunk's text is the exact
    /// slice `text[offset.start..offset.end]`, so inner whitespace is preserved.
    pub fn chunk(&self, source_id: &str, text: &str, created_at: DateTime<Utc>) -> Vec<DocumentChunk> {
        let spans = token_spans(text);
        if spans.is_empty() { return Vec::new(); }
        let step = self.config.window_tokens - self.config.overlap_tokens;
        let mut chunks = Vec::new();
        let mut start = 0usize;
        loop {
            let end = (start + self.config.window_tokens).min(spans.len());
            let offset = SourceOffset { start: spans[start].0, end: spans[end - 1].1 };
            let sequence_number = chunks.len();
            chunks.push(DocumentChunk {
                id: DocumentChunk::chunk_id(source_id, sequence_number),
                source_id: source_id.to_string(),
                text: text[offset.start..offset.end].to_string(),
                sequence_number,
                source_offset: offset,
                created_at,
            });
            if end >= spans.len() { break; }
            start += step;
        }
        chunks
    }
}

/// Byte ranges of the whitespace-separated tokens of `text`.
fn token_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<usize> = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), current) {
            (true, Some(start)) => { spans.push((start, i)); current = None; }
            (false, None) => current = Some(i),
            _ => {}
        }
    }
    if let Some(start) = current { spans.push((start, text.len())); }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_spans_handle_unicode_and_runs_of_whitespace() {
        let text = "  héllo \t wörld\n";
        let spans = token_spans(text);
        let words: Vec<&str> = spans.iter().map(|&(s, e)| &text[s..e]).collect();
        assert_eq!(words, vec!["héllo", "wörld"]);
    }

    #[test]
    fn windows_overlap_and_cover_every_token() {
        let chunker = Chunker::new(ChunkingConfig { window_tokens: 4, overlap_tokens: 1 }).expect("chunker");
        let text = "a b c d e f g h i j";
        let chunks = chunker.chunk("doc", text, Utc::now());
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a b c d", "d e f g", "g h i j"]);
        assert_eq!(chunks[1].id, "doc-1");
        assert_eq!(&text[chunks[2].source_offset.start..chunks[2].source_offset.end], "g h i j");
    }
}
