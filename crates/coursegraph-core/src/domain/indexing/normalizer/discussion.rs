use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::indexing::chunk::{Chunk, ChunkBuilder};
use crate::domain::memory::anonymize_student_id;
use crate::error::{Error, Result};

use super::{SourceAdapter, SourceDocument, SourceKind};

const INTERROGATIVES: &[&str] = &["how", "what", "why", "when", "where", "which", "who"];
const QUESTION_PHRASES: &[&str] = &["can someone", "does anyone", "is there a way"];
const CONFUSION_PHRASES: &[&str] = &[
    "don't understand",
    "do not understand",
    "confused",
    "unclear",
    "not sure",
    "doesn't make sense",
    "stuck",
    "help",
];
const INSIGHT_PHRASES: &[&str] = &[
    "i think",
    "my understanding",
    "note that",
    "important",
    "key point",
    "realize",
    "insight",
];
const ANSWER_PHRASES: &[&str] = &[
    "the answer",
    "solution",
    "you can",
    "try this",
    "according to",
    "the way to",
];

/// What a forum post is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostKind {
    Question,
    Confusion,
    Insight,
    Answer,
    General,
}

impl PostKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "QUESTION",
            Self::Confusion => "CONFUSION",
            Self::Insight => "INSIGHT",
            Self::Answer => "ANSWER",
            Self::General => "GENERAL",
        }
    }

    /// Keyword classification, checked in order question, confusion,
    /// insight, answer
    pub fn classify(content: &str) -> Self {
        let lower = content.to_lowercase();
        let first_word = lower
            .split_whitespace()
            .next()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .unwrap_or_default();

        let has = |phrases: &[&str]| phrases.iter().any(|p| lower.contains(p));

        if lower.contains('?') || INTERROGATIVES.contains(&first_word) || has(QUESTION_PHRASES) {
            Self::Question
        } else if has(CONFUSION_PHRASES) {
            Self::Confusion
        } else if has(INSIGHT_PHRASES) {
            Self::Insight
        } else if has(ANSWER_PHRASES) {
            Self::Answer
        } else {
            Self::General
        }
    }
}

/// A post after anonymization and classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: Option<String>,
    /// `student_<hash prefix>`; the raw author never leaves the adapter
    pub author: Option<String>,
    pub thread_id: Option<String>,
    pub kind: PostKind,
    pub content: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Export {
    Wrapped { posts: Vec<RawPost> },
    Bare(Vec<RawPost>),
}

#[derive(Debug, Deserialize)]
struct RawPost {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    thread_id: Option<Value>,
}

fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Discussion-forum exports: `{"posts": [...]}` or a bare array
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscussionAdapter;

impl DiscussionAdapter {
    pub fn parse_posts(&self, content: &str) -> Result<Vec<Post>> {
        let export: Export = serde_json::from_str(content)
            .map_err(|e| Error::InvalidInput(format!("Malformed discussion export: {}", e)))?;
        let raw = match export {
            Export::Wrapped { posts } => posts,
            Export::Bare(posts) => posts,
        };

        Ok(raw
            .into_iter()
            .filter(|p| !p.content.trim().is_empty())
            .map(|p| Post {
                id: id_string(p.id),
                author: p
                    .author
                    .filter(|a| !a.trim().is_empty())
                    .map(|a| anonymize_student_id(&a)),
                thread_id: id_string(p.thread_id),
                kind: PostKind::classify(&p.content),
                content: p.content.trim().to_string(),
            })
            .collect())
    }
}

impl SourceAdapter for DiscussionAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Discussion
    }

    fn normalize(&self, doc: &SourceDocument) -> Result<Vec<Chunk>> {
        let mut builder = ChunkBuilder::new(&doc.source_id);
        for post in self.parse_posts(&doc.content)? {
            builder.push(&format!("[{}] {}", post.kind.as_str(), post.content));
        }
        Ok(builder.finish())
    }
}
