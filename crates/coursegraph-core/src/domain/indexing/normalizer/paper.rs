use regex::Regex;
use std::sync::LazyLock;

use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;

use super::{SourceAdapter, SourceDocument, SourceKind};

static NAMED_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:\d+(?:\.\d+)*\.?\s+)?(abstract|introduction|background|related work|methodology|methods|implementation|evaluation|results|discussion|conclusions?|references|bibliography)\s*:?\s*$",
    )
    .expect("valid section regex")
});
static NUMBERED_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+(?:\.\d+)*\.?\s+[A-Z][A-Za-z]").expect("valid numbered section regex")
});
static CAPS_SECTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Z][A-Z\s]{3,}$").expect("valid caps section regex"));
static LATEX_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\\(?:sub)*section\*?\{([^}]*)\}").expect("valid latex section regex")
});

const MAX_HEADING_WORDS: usize = 8;

/// Academic papers: section detection plus sentence packing
///
/// Sentences are packed into chunks of at most `chunk_size` words within
/// a section, and the trailing sentences of a full chunk (up to `overlap`
/// words) open the next one. Every chunk starts with its section name.
#[derive(Debug, Clone, Copy)]
pub struct PaperAdapter {
    chunk_size: usize,
    overlap: usize,
}

impl PaperAdapter {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            overlap: overlap.min(chunk_size - 1),
        }
    }
}

impl SourceAdapter for PaperAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Paper
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let mut builder = ChunkBuilder::new(&doc.source_id);
        let mut offset = 0;

        for (name, body) in split_sections(&doc.content) {
            let sentences = split_sentences(&body, offset, self.chunk_size);
            offset += body.split_whitespace().count();
            for (start, text) in self.pack(&sentences) {
                builder.push_at(&format!("{}\n\n{}", name, text), start);
            }
        }

        Ok(builder.finish())
    }
}

#[derive(Debug, Clone)]
struct Sentence {
    text: String,
    start: usize,
    words: usize,
}

impl PaperAdapter {
    fn pack(&self, sentences: &[Sentence]) -> Vec<(usize, String)> {
        let mut windows = Vec::new();
        let mut window: Vec<&Sentence> = Vec::new();
        let mut words = 0;

        for sentence in sentences {
            if words + sentence.words > self.chunk_size && !window.is_empty() {
                windows.push(render(&window));

                let mut carried = Vec::new();
                let mut carried_words = 0;
                for prev in window.iter().rev() {
                    if carried_words + prev.words > self.overlap {
                        break;
                    }
                    carried_words += prev.words;
                    carried.push(*prev);
                }
                carried.reverse();
                window = carried;
                words = carried_words;

                while !window.is_empty() && words + sentence.words > self.chunk_size {
                    words -= window[0].words;
                    window.remove(0);
                }
            }
            window.push(sentence);
            words += sentence.words;
        }
        if !window.is_empty() {
            windows.push(render(&window));
        }
        windows
    }
}

fn render(window: &[&Sentence]) -> (usize, String) {
    let start = window.first().map(|s| s.start).unwrap_or_default();
    let text = window
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    (start, text)
}

fn heading_name(line: &str) -> Option<String> {
    if let Some(caps) = LATEX_SECTION.captures(line) {
        return Some(caps[1].trim().to_string());
    }
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.split_whitespace().count() > MAX_HEADING_WORDS {
        return None;
    }
    if NAMED_SECTION.is_match(trimmed)
        || CAPS_SECTION.is_match(trimmed)
        || (NUMBERED_SECTION.is_match(trimmed) && !trimmed.ends_with('.'))
    {
        return Some(trimmed.to_string());
    }
    None
}

/// `(section name, body)` pairs; text before the first heading belongs to
/// an implicit "Introduction"
fn split_sections(content: &str) -> Vec<(String, String)> {
    let mut sections = Vec::new();
    let mut name = "Introduction".to_string();
    let mut body = String::new();

    for line in content.lines() {
        match heading_name(line) {
            Some(next) => {
                if !body.trim().is_empty() {
                    sections.push((name, std::mem::take(&mut body)));
                }
                body.clear();
                name = next;
            }
            None => {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    if !body.trim().is_empty() {
        sections.push((name, body));
    }
    sections
}

/// Sentences end at a word whose last character (ignoring closing quotes
/// and brackets) is `.`, `!` or `?`; overlong sentences are cut at
/// `max_words`
fn split_sentences(body: &str, offset: usize, max_words: usize) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = offset;

    let mut flush = |current: &mut Vec<&str>, start: &mut usize| {
        if current.is_empty() {
            return;
        }
        sentences.push(Sentence {
            text: current.join(" "),
            start: *start,
            words: current.len(),
        });
        *start += current.len();
        current.clear();
    };

    for word in body.split_whitespace() {
        current.push(word);
        let terminal = word
            .trim_end_matches(['"', '\'', ')', ']'])
            .ends_with(['.', '!', '?']);
        if terminal || current.len() >= max_words {
            flush(&mut current, &mut start);
        }
    }
    flush(&mut current, &mut start);
    sentences
}
