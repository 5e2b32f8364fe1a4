//! Graph store trait
//!
//! The single sink shared by batch indexing and fact-log sync. Every write
//! is an upsert keyed by a canonical or deterministic id, so replays and
//! interleavings across writers converge to the same state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain::memory::LearningEvent;
use crate::error::Result;

use super::community::Community;
use super::entity::{CanonicalEntity, EntityType};
use super::relationship::Relationship;

/// A resolution decision left for a human
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFlag {
    /// Lexically smaller subject of the pair
    pub subject_a: String,
    pub subject_b: String,
    pub reason: String,
}

impl ReviewFlag {
    /// Create a flag, ordering the pair so (a, b) and (b, a) collapse
    pub fn new(a: impl Into<String>, b: impl Into<String>, reason: impl Into<String>) -> Self {
        let (a, b) = (a.into(), b.into());
        let (subject_a, subject_b) = if a <= b { (a, b) } else { (b, a) };
        Self {
            subject_a,
            subject_b,
            reason: reason.into(),
        }
    }
}

/// Row counts across the graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entities: u64,
    pub relationships: u64,
    pub communities: u64,
    pub learning_events: u64,
    pub review_flags: u64,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Fail with a store error if the backend is unreachable
    async fn health_check(&self) -> Result<()>;

    // ========== Entities ==========

    /// Insert or update an entity; aliases and evidence are unioned
    async fn upsert_entity(&self, entity: &CanonicalEntity) -> Result<()>;

    async fn get_entity(&self, id: &str) -> Result<Option<CanonicalEntity>>;

    /// Find an entity with a matching normalized alias, optionally by type
    async fn find_entity_by_alias(
        &self,
        entity_type: Option<EntityType>,
        name: &str,
    ) -> Result<Option<CanonicalEntity>>;

    /// All entities, ordered by id
    async fn list_entities(&self) -> Result<Vec<CanonicalEntity>>;

    // ========== Relationships ==========

    /// Insert or update an edge; evidence chunk ids are unioned
    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()>;

    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>>;

    /// All relationships, ordered by id
    async fn list_relationships(&self) -> Result<Vec<Relationship>>;

    // ========== Change detection ==========

    /// Content hashes last persisted for a source
    async fn chunk_hashes_for_source(&self, source_id: &str) -> Result<HashSet<String>>;

    async fn record_chunk_hash(&self, source_id: &str, chunk_id: &str, content_hash: &str) -> Result<()>;

    /// Drop persisted hashes for a source that are not in `keep`
    ///
    /// Returns how many were dropped.
    async fn supersede_chunk_hashes(&self, source_id: &str, keep: &HashSet<String>) -> Result<u64>;

    // ========== Communities ==========

    /// Atomically replace the whole community hierarchy
    async fn replace_communities(&self, communities: &[Community]) -> Result<()>;

    /// All communities, ordered by level then id
    async fn list_communities(&self) -> Result<Vec<Community>>;

    // ========== Learning events ==========

    /// Apply a learning event keyed by its idempotency key
    ///
    /// Returns `true` only the first time a key is applied.
    async fn apply_learning_event(&self, event: &LearningEvent, idempotency_key: &str) -> Result<bool>;

    async fn count_learning_events(&self) -> Result<u64>;

    // ========== Review ==========

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()>;

    async fn list_review_flags(&self) -> Result<Vec<ReviewFlag>>;

    async fn stats(&self) -> Result<GraphStats>;
}
