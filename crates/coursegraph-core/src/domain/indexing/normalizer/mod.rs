//! Content normalizer
//!
//! Source adapters turn raw course materials into uniform [`Chunk`]s. This
//! is the only layer that knows anything about file formats; everything
//! downstream sees chunk text, ids and hashes.

mod assignment;
mod code;
mod discussion;
mod notes;
mod paper;
mod slides;
mod transcript;

pub use assignment::AssignmentAdapter;
pub use code::CodeAdapter;
pub use discussion::{DiscussionAdapter, PostKind};
pub use notes::NotesAdapter;
pub use paper::PaperAdapter;
pub use slides::SlidesAdapter;
pub use transcript::TranscriptAdapter;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::chunk::Chunk;

/// Kind of course material, selected from file metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Slides,
    Paper,
    Transcript,
    Code,
    Discussion,
    Assignment,
    Notes,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Slides => "slides",
            Self::Paper => "paper",
            Self::Transcript => "transcript",
            Self::Code => "code",
            Self::Discussion => "discussion",
            Self::Assignment => "assignment",
            Self::Notes => "notes",
        }
    }

    /// Infer the kind from a file extension; `None` for unsupported files
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "slides" | "deck" => Some(Self::Slides),
            "paper" | "tex" => Some(Self::Paper),
            "txt" | "srt" | "vtt" | "transcript" => Some(Self::Transcript),
            "json" => Some(Self::Discussion),
            "assignment" | "hw" => Some(Self::Assignment),
            "md" | "markdown" | "notes" => Some(Self::Notes),
            "rs" | "py" | "go" | "java" | "c" | "h" | "cc" | "cpp" | "hpp" | "js" | "ts" => {
                Some(Self::Code)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw source, before normalization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable identifier, the path relative to the corpus root
    pub source_id: String,
    /// File name, used by adapters that care about the language
    pub name: String,
    pub kind: SourceKind,
    pub content: String,
}

impl SourceDocument {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, content: impl Into<String>) -> Self {
        let source_id = source_id.into();
        let name = source_id
            .rsplit('/')
            .next()
            .unwrap_or(source_id.as_str())
            .to_string();
        Self {
            source_id,
            name,
            kind,
            content: content.into(),
        }
    }

    /// Lowercased file extension of `name`, empty when there is none
    pub fn extension(&self) -> String {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

/// Capability implemented once per source kind
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Split one document into chunks, in reading order
    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>>;
}

/// Dispatches documents to the adapter registered for their kind
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every built-in adapter; papers are packed to
    /// `chunk_size` tokens with `overlap` tokens carried between chunks
    pub fn with_chunking(chunk_size: usize, overlap: usize) -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(SlidesAdapter));
        registry.register(Box::new(PaperAdapter::new(chunk_size, overlap)));
        registry.register(Box::new(TranscriptAdapter::default()));
        registry.register(Box::new(CodeAdapter::default()));
        registry.register(Box::new(DiscussionAdapter::default()));
        registry.register(Box::new(AssignmentAdapter));
        registry.register(Box::new(NotesAdapter));
        registry
    }

    /// Replace the adapter for its kind
    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let adapter = self.adapters.get(&doc.kind).ok_or_else(|| {
            Error::InvalidInput(format!("No adapter registered for {} sources", doc.kind))
        })?;
        let chunks = adapter.normalize(doc)?;
        debug!(
            source_id = %doc.source_id,
            kind = %doc.kind,
            chunks = chunks.len(),
            "Normalized source"
        );
        Ok(chunks)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_chunking(512, 102)
    }
}

/// An ordered set of sources to index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpus {
    pub sources: Vec<SourceDocument>,
}

impl Corpus {
    /// Sources are sorted by id so every run sees the same order
    pub fn from_documents(mut sources: Vec<SourceDocument>) -> Self {
        sources.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Self { sources }
    }

    /// Walk `root` recursively, keeping files with a known [`SourceKind`]
    ///
    /// Hidden entries are skipped; files that are not valid UTF-8 are
    /// skipped with a warning.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut files = Vec::new();
        collect_files(root, &mut files)?;

        let mut sources = Vec::new();
        for path in files {
            let Some(kind) = SourceKind::from_path(&path) else {
                debug!(path = %path.display(), "Skipping unsupported file");
                continue;
            };
            let source_id = relative_id(root, &path)?;
            let bytes = std::fs::read(&path)?;
            match String::from_utf8(bytes) {
                Ok(content) => sources.push(SourceDocument::new(source_id, kind, content)),
                Err(_) => warn!(source_id = %source_id, "Skipping source that is not UTF-8"),
            }
        }

        Ok(Self::from_documents(sources))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    Ok(())
}

fn relative_id(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::InvalidInput(format!("{} is outside the corpus root", path.display()))
    })?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
