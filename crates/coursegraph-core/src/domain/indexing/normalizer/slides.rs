use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;

use super::{SourceAdapter, SourceDocument, SourceKind};

/// One chunk per slide
///
/// Slides are separated by a `---` line or a form feed. The first
/// non-empty line is the title and is repeated at the top of the chunk;
/// a `Notes:` line turns the rest of the slide into speaker notes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlidesAdapter;

impl SourceAdapter for SlidesAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Slides
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let mut builder = ChunkBuilder::new(&doc.source_id);
        for slide in split_slides(&doc.content) {
            builder.push(&render_slide(&slide));
        }
        Ok(builder.finish())
    }
}

fn split_slides(content: &str) -> Vec<String> {
    let mut slides = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        let mut parts = line.split('\x0c');
        if let Some(first) = parts.next() {
            if first.trim() == "---" {
                slides.push(std::mem::take(&mut current));
                continue;
            }
            current.push_str(first);
            current.push('\n');
        }
        for rest in parts {
            slides.push(std::mem::take(&mut current));
            current.push_str(rest);
            current.push('\n');
        }
    }
    slides.push(current);

    slides
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect()
}

fn render_slide(slide: &str) -> String {
    let mut lines = slide.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(first) = lines.next() else {
        return String::new();
    };
    let title = first.trim_start_matches('#').trim();

    let mut body = Vec::new();
    let mut notes = Vec::new();
    let mut in_notes = false;
    for line in lines {
        if let Some(rest) = line.strip_prefix("Notes:") {
            in_notes = true;
            if !rest.trim().is_empty() {
                notes.push(rest.trim());
            }
        } else if in_notes {
            notes.push(line);
        } else {
            body.push(line);
        }
    }

    let mut text = title.to_string();
    if !body.is_empty() {
        text.push_str("\n\n");
        text.push_str(&body.join("\n"));
    }
    if !notes.is_empty() {
        text.push_str("\n\n[Notes: ");
        text.push_str(&notes.join(" "));
        text.push(']');
    }
    text
}
