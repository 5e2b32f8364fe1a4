//! Traits for the external model services the indexing core calls
//!
//! Implemented over HTTP by [`crate::llm`] and by in-process fakes in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::entity::EntityType;

/// Batch text embedding
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed `texts`, returning one vector per input in the same order
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Schema-constrained JSON completion
#[async_trait]
pub trait StructuredCompletion: Send + Sync {
    /// Complete `prompt`, returning JSON matching `schema`
    ///
    /// Malformed output surfaces as `Error::SchemaViolation`, which callers
    /// treat as retryable.
    async fn complete(&self, prompt: &str, schema: &serde_json::Value) -> Result<serde_json::Value>;
}

/// One side of a pair submitted for adjudication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationSubject {
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Merge,
    Distinct,
    /// The adjudicator could not decide; treated as distinct
    Undecided,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjudicationOutcome {
    pub verdict: Verdict,
    pub justification: String,
}

/// Decides whether two ambiguous entities are the same thing
#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn adjudicate(
        &self,
        a: &AdjudicationSubject,
        b: &AdjudicationSubject,
    ) -> Result<AdjudicationOutcome>;
}

/// Member description handed to the summarizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityMember {
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
}

/// Writes a short summary for a community
#[async_trait]
pub trait CommunitySummarizer: Send + Sync {
    async fn summarize(&self, members: &[CommunityMember]) -> Result<String>;
}
