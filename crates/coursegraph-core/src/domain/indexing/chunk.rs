//! Normalized text chunks

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A unit of extraction work
///
/// Identity for change detection is `content_hash`; a chunk is never
/// mutated, only superseded when its source changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{source_id}#{content hash prefix}`; edits elsewhere in the source
    /// never hand this id to different text
    pub id: String,
    pub source_id: String,
    /// Position within the source, for ordering only
    pub ordinal: usize,
    pub text: String,
    /// Start and end word offsets within the normalized source
    pub token_span: (usize, usize),
    pub content_hash: String,
}

impl Chunk {
    pub fn new(source_id: &str, ordinal: usize, text: impl Into<String>, token_span: (usize, usize)) -> Self {
        let text = text.into();
        let content_hash = content_hash(&text);
        Self {
            id: chunk_id(source_id, &content_hash),
            source_id: source_id.to_string(),
            ordinal,
            content_hash,
            text,
            token_span,
        }
    }

    pub fn token_count(&self) -> usize {
        self.token_span.1 - self.token_span.0
    }
}

const CHUNK_ID_HASH_CHARS: usize = 16;

pub fn chunk_id(source_id: &str, content_hash: &str) -> String {
    let prefix = content_hash.get(..CHUNK_ID_HASH_CHARS).unwrap_or(content_hash);
    format!("{}#{}", source_id, prefix)
}

/// SHA-256 over whitespace-normalized text, hex encoded
///
/// Reflowing a paragraph does not change the hash; editing a word does.
pub fn content_hash(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    hex::encode(Sha256::digest(normalized.as_bytes()))
}

/// Whitespace-delimited word count, the token unit used for spans
pub fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Assigns ordinals and word spans while an adapter emits chunk texts
#[derive(Debug)]
pub struct ChunkBuilder<'a> {
    source_id: &'a str,
    offset: usize,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkBuilder<'a> {
    pub fn new(source_id: &'a str) -> Self {
        Self {
            source_id,
            offset: 0,
            chunks: Vec::new(),
        }
    }

    /// Emit `text` immediately after the previous chunk; blank text is skipped
    pub fn push(&mut self, text: &str) {
        let start = self.offset;
        self.push_at(text, start);
    }

    /// Emit `text` starting at word offset `start` (for overlapping windows)
    pub fn push_at(&mut self, text: &str, start: usize) {
        let text = text.trim();
        let words = count_tokens(text);
        if words == 0 {
            return;
        }
        let end = start + words;
        let ordinal = self.chunks.len();
        self.chunks
            .push(Chunk::new(self.source_id, ordinal, text, (start, end)));
        self.offset = self.offset.max(end);
    }

    pub fn finish(self) -> Vec<Chunk> {
        self.chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_ignores_whitespace_layout() {
        assert_eq!(
            content_hash("Raft  elects\na leader"),
            content_hash(" Raft elects a leader ")
        );
        assert_ne!(content_hash("Raft elects a leader"), content_hash("Raft elects a follower"));
        assert_eq!(content_hash("x").len(), 64);
    }

    #[test]
    fn test_builder_assigns_ids_and_spans() {
        let mut builder = ChunkBuilder::new("week1/raft.md");
        builder.push("Raft is a consensus algorithm");
        builder.push("   ");
        builder.push("It elects a leader");
        let chunks = builder.finish();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].ordinal, 0);
        assert_eq!(chunks[0].token_span, (0, 5));
        assert_eq!(chunks[1].ordinal, 1);
        assert_eq!(chunks[1].token_span, (5, 9));
        assert_eq!(
            chunks[0].id,
            format!("week1/raft.md#{}", &content_hash("Raft is a consensus algorithm")[..16])
        );
        assert_eq!(chunks[1].token_count(), 4);
    }

    #[test]
    fn test_id_follows_text_not_position() {
        let mut before = ChunkBuilder::new("a.notes");
        before.push("Raft implements leader election");
        let before = before.finish();

        let mut after = ChunkBuilder::new("a.notes");
        after.push("Paxos is older");
        after.push("Raft implements leader election");
        let after = after.finish();

        assert_eq!(after[1].id, before[0].id);
        assert_ne!(after[0].id, before[0].id);
        assert_eq!(after[1].ordinal, 1);
    }

    #[test]
    fn test_builder_overlapping_windows() {
        let mut builder = ChunkBuilder::new("paper.tex");
        builder.push_at("one two three four", 0);
        builder.push_at("four five six", 3);
        let chunks = builder.finish();
        assert_eq!(chunks[1].token_span, (3, 6));
    }
}
