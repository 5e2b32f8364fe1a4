use regex::Regex;
use std::sync::LazyLock;

use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;

use super::{SourceAdapter, SourceDocument, SourceKind};

static RUST_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|const|unsafe|extern\s+"[^"]*")\s+)*(?:fn|struct|enum|trait|impl|mod|type|union|macro_rules!)\b"#,
    )
    .expect("valid rust declaration regex")
});
static PYTHON_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+def|def|class)\s").expect("valid python declaration regex")
});
static GO_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:func|type)\s").expect("valid go declaration regex"));
static JAVA_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:public|private|protected|abstract|final|static|sealed)\s+)*(?:class|interface|enum|record)\s")
        .expect("valid java declaration regex")
});
static C_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:typedef\s+)?(?:struct|class|enum|union|namespace)\s+\w+|[A-Za-z_][\w\s\*:<>,&]*\s[\*&]?[A-Za-z_][\w:]*\s*\([^;]*$)")
        .expect("valid c declaration regex")
});
static JS_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:export\s+)?(?:default\s+)?(?:async\s+)?(?:function\*?|class|interface|type\s+\w+\s*=|const\s+\w+\s*=\s*(?:async\s*)?(?:\(|function))")
        .expect("valid js declaration regex")
});

/// Source code split at top-level declarations
///
/// Each declaration keeps the comment, attribute or decorator lines
/// directly above it. Imports and other leading lines form their own
/// chunk; a file with no recognised declarations is one chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodeAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Rust,
    Python,
    Go,
    Java,
    C,
    JavaScript,
}

impl Language {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "rs" => Some(Self::Rust),
            "py" => Some(Self::Python),
            "go" => Some(Self::Go),
            "java" => Some(Self::Java),
            "c" | "h" | "cc" | "cpp" | "hpp" => Some(Self::C),
            "js" | "ts" => Some(Self::JavaScript),
            _ => None,
        }
    }

    fn declaration(&self) -> &'static Regex {
        match self {
            Self::Rust => &*RUST_DECL,
            Self::Python => &*PYTHON_DECL,
            Self::Go => &*GO_DECL,
            Self::Java => &*JAVA_DECL,
            Self::C => &*C_DECL,
            Self::JavaScript => &*JS_DECL,
        }
    }

    /// Lines that belong to the declaration below them
    fn is_leading(&self, line: &str) -> bool {
        let t = line.trim_start();
        match self {
            Self::Python => t.starts_with('#') || t.starts_with('@'),
            Self::Rust => t.starts_with("//") || t.starts_with("#[") || t.starts_with("/*") || t.starts_with('*'),
            Self::Java => t.starts_with("//") || t.starts_with('@') || t.starts_with("/*") || t.starts_with('*'),
            Self::Go | Self::C | Self::JavaScript => {
                t.starts_with("//") || t.starts_with("/*") || t.starts_with('*')
            }
        }
    }
}

impl SourceAdapter for CodeAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Code
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let lines: Vec<&str> = doc.content.lines().collect();
        let starts = Language::from_extension(&doc.extension())
            .map(|lang| declaration_starts(lang, &lines))
            .unwrap_or_default();

        let mut builder = ChunkBuilder::new(&doc.source_id);
        if starts.is_empty() {
            builder.push(&doc.content);
            return Ok(builder.finish());
        }

        builder.push(&lines[..starts[0]].join("\n"));
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(lines.len());
            builder.push(&lines[start..end].join("\n"));
        }
        Ok(builder.finish())
    }
}

/// Line indices where each top-level declaration's chunk begins
fn declaration_starts(lang: Language, lines: &[&str]) -> Vec<usize> {
    let pattern = lang.declaration();
    let mut starts: Vec<usize> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if !pattern.is_match(line) {
            continue;
        }
        let floor = starts.last().map(|s| s + 1).unwrap_or(0);
        let mut start = i;
        while start > floor && lang.is_leading(lines[start - 1]) && !lines[start - 1].trim().is_empty() {
            start -= 1;
        }
        starts.push(start);
    }
    starts
}
