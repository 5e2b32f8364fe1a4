//! Knowledge graph domain module
//!
//! Types for the typed course knowledge graph and the traits the indexing
//! core depends on:
//!
//! - **Entities**: fixed-schema candidate and canonical entities
//! - **Relationships**: fixed-schema edges with unioned evidence
//! - **Communities**: the hierarchical clustering of entities
//! - **GraphStore**: the idempotent upsert sink
//! - **Clients**: embedding, structured completion, adjudication, summaries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use coursegraph_core::domain::knowledge::{CanonicalEntity, EntityType, GraphStore};
//!
//! let raft = CanonicalEntity::new("Raft", EntityType::Algorithm)
//!     .with_description("Consensus algorithm built around a replicated log");
//! store.upsert_entity(&raft).await?;
//! ```

mod clients;
mod community;
mod entity;
mod relationship;
mod repository;

pub use clients::{
    AdjudicationOutcome, AdjudicationSubject, Adjudicator, CommunityMember, CommunitySummarizer,
    EmbeddingClient, StructuredCompletion, Verdict,
};
pub use community::Community;
pub use entity::{CandidateEntity, CanonicalEntity, EntityType, canonical_id, normalize_name};
pub use relationship::{CandidateRelationship, Relationship, RelationshipType, relationship_id};
pub use repository::{GraphStats, GraphStore, ReviewFlag};
