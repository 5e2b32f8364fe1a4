use regex::Regex;
use std::sync::LazyLock;

use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;

use super::{SourceAdapter, SourceDocument, SourceKind};

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").expect("valid heading regex"));

/// Markdown notes split on headings
///
/// Each section becomes `heading\n\ncontent`. Text before the first
/// heading is its own chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotesAdapter;

impl SourceAdapter for NotesAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Notes
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let mut builder = ChunkBuilder::new(&doc.source_id);
        let mut heading: Option<String> = None;
        let mut body: Vec<&str> = Vec::new();
        let mut in_fence = false;

        for line in doc.content.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
            }
            let captures = if in_fence {
                None
            } else {
                HEADING.captures(line)
            };
            match captures {
                Some(caps) => {
                    builder.push(&section_text(heading.as_deref(), &body));
                    heading = Some(caps[2].trim().to_string());
                    body.clear();
                }
                None => body.push(line),
            }
        }
        builder.push(&section_text(heading.as_deref(), &body));

        Ok(builder.finish())
    }
}

fn section_text(heading: Option<&str>, body: &[&str]) -> String {
    let content = body.join("\n");
    let content = content.trim();
    match heading {
        Some(h) if content.is_empty() => h.to_string(),
        Some(h) => format!("{}\n\n{}", h, content),
        None => content.to_string(),
    }
}
