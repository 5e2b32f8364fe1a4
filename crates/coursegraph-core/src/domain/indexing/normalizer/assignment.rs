use regex::Regex;
use std::sync::LazyLock;

use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;

use super::{SourceAdapter, SourceDocument, SourceKind};

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.+)$").expect("valid heading regex"));

static REQUIREMENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)requirement|deliverable|task|must|what to (do|submit)").expect("valid requirements regex")
});

static GRADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)grading|rubric|criteria|evaluation|scoring|points").expect("valid grading regex")
});

static CONCEPTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)concept|topic|learning (goal|objective)|objective").expect("valid concepts regex")
});

static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*+]|\d+[.)])\s+").expect("valid list marker regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Description,
    Requirements,
    Grading,
    Concepts,
}

impl Section {
    fn classify(heading: &str) -> Self {
        // Grading first: "Grading requirements" is a rubric, not a task list
        if GRADING.is_match(heading) {
            Self::Grading
        } else if REQUIREMENTS.is_match(heading) {
            Self::Requirements
        } else if CONCEPTS.is_match(heading) {
            Self::Concepts
        } else {
            Self::Description
        }
    }
}

#[derive(Debug, Default)]
struct AssignmentParts {
    title: Option<String>,
    description: Vec<String>,
    requirements: Vec<String>,
    grading: Vec<String>,
    concepts: Vec<String>,
}

/// Assignment handouts split into title, description, requirements,
/// grading criteria and target concepts
///
/// Sections are recognised by their heading. Each kind becomes one chunk,
/// so a rubric spread over several headings still reads as one list.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssignmentAdapter;

impl SourceAdapter for AssignmentAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Assignment
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let parts = parse(&doc.content);
        let mut builder = ChunkBuilder::new(&doc.source_id);

        if let Some(title) = &parts.title {
            builder.push(&format!("Title: {}", title));
        }
        if !parts.description.is_empty() {
            builder.push(&format!("Description:\n{}", parts.description.join(" ")));
        }
        if !parts.requirements.is_empty() {
            builder.push(&format!("Requirements:\n{}", bullets(&parts.requirements)));
        }
        if !parts.grading.is_empty() {
            builder.push(&format!("Grading Criteria:\n{}", bullets(&parts.grading)));
        }
        if !parts.concepts.is_empty() {
            builder.push(&format!("Target Concepts: {}", parts.concepts.join(", ")));
        }
        Ok(builder.finish())
    }
}

fn parse(content: &str) -> AssignmentParts {
    let mut parts = AssignmentParts::default();
    let mut section = Section::Description;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = HEADING.captures(line) {
            let heading = caps[1].trim();
            if parts.title.is_none() {
                parts.title = Some(heading.to_string());
                section = Section::Description;
            } else {
                section = Section::classify(heading);
            }
            continue;
        }
        if parts.title.is_none() {
            parts.title = Some(line.to_string());
            continue;
        }

        let item = LIST_MARKER.replace(line, "").trim().to_string();
        if item.is_empty() {
            continue;
        }
        match section {
            Section::Description => parts.description.push(item),
            Section::Requirements => parts.requirements.push(item),
            Section::Grading => parts.grading.push(item),
            Section::Concepts => {
                for concept in item.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                    if !parts.concepts.iter().any(|c| c.eq_ignore_ascii_case(concept)) {
                        parts.concepts.push(concept.to_string());
                    }
                }
            }
        }
    }
    parts
}

fn bullets(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}
