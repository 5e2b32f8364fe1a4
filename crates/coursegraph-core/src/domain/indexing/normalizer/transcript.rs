use regex::Regex;
use std::sync::LazyLock;

use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;

use super::{SourceAdapter, SourceDocument, SourceKind};

static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\[?\d{1,2}:\d{2}(?::\d{2})?(?:[.,]\d{1,3})?\]?").expect("valid timestamp regex")
});
static TOPIC_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:next|now|moving on|let's talk about|topic|section)\b|^\s*\d+\.\s")
        .expect("valid topic marker regex")
});
static PHRASE_FILLERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:you know|i mean|sort of|kind of)\b,?\s*").expect("valid filler regex")
});
static LIKE_FILLER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\blike,\s*").expect("valid filler regex"));
static SEQUENCE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+\s*$").expect("valid cue number regex"));

const WORD_FILLERS: &[&str] = &[
    "um", "umm", "uh", "uhh", "er", "ah", "hmm", "basically", "actually", "literally",
];

/// Lecture transcripts
///
/// Filler words are removed line by line, then the text is segmented at
/// timestamps and spoken topic markers ("Moving on", "Next", "3."). A
/// transcript with no such boundaries falls back to paragraphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TranscriptAdapter;

impl SourceAdapter for TranscriptAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Transcript
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let mut segments = segment(&doc.content);
        if segments.len() <= 1 {
            segments = paragraphs(&doc.content);
        }

        let mut builder = ChunkBuilder::new(&doc.source_id);
        for segment in segments {
            builder.push(&segment);
        }
        Ok(builder.finish())
    }
}

/// Strip spoken fillers from one line
pub fn remove_fillers(line: &str) -> String {
    let line = PHRASE_FILLERS.replace_all(line, "");
    let line = LIKE_FILLER.replace_all(&line, "");
    line.split_whitespace()
        .filter(|word| {
            let bare = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            !WORD_FILLERS.contains(&bare.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_cue_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.eq_ignore_ascii_case("WEBVTT") || SEQUENCE_NUMBER.is_match(trimmed)
}

fn segment(content: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();

    let mut close = |current: &mut Vec<String>| {
        if !current.is_empty() {
            segments.push(current.join(" "));
            current.clear();
        }
    };

    for raw in content.lines() {
        if is_cue_line(raw) {
            continue;
        }
        if let Some(stamp) = TIMESTAMP.find(raw) {
            close(&mut current);
            // Only the timestamp itself is dropped; SRT arrow lines vanish whole
            let rest = &raw[stamp.end()..];
            if rest.contains("-->") {
                continue;
            }
            let cleaned = remove_fillers(rest);
            if !cleaned.is_empty() {
                current.push(cleaned);
            }
            continue;
        }
        if TOPIC_MARKER.is_match(raw) {
            close(&mut current);
        }
        let cleaned = remove_fillers(raw);
        if !cleaned.is_empty() {
            current.push(cleaned);
        }
    }
    close(&mut current);
    segments
}

fn paragraphs(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for raw in content.lines() {
        if raw.trim().is_empty() {
            if !current.is_empty() {
                out.push(current.join(" "));
                current.clear();
            }
            continue;
        }
        if is_cue_line(raw) {
            continue;
        }
        let cleaned = remove_fillers(raw);
        if !cleaned.is_empty() {
            current.push(cleaned);
        }
    }
    if !current.is_empty() {
        out.push(current.join(" "));
    }
    out
}
