//! Coursegraph Core Library
//!
//! This crate builds and maintains a typed knowledge graph of course
//! material:
//! - Normalization of slides, papers, transcripts, code, forum posts and notes
//! - Schema-constrained extraction with gleaning passes
//! - Three-tier entity resolution (exact, embedding, adjudicated)
//! - Full, incremental and staging indexing runs
//! - Hierarchical community detection with summaries
//! - Durable fact log of learning events, synced to the graph behind a
//!   circuit breaker
//! - Storage (SQLite) and LLM integration (OpenAI-compatible API)

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod llm;
pub mod logging;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::domain::indexing::{
        CommunityDetector, Corpus, EntityResolver, Extractor, IndexMode, IndexingReport,
        Orchestrator, SourceDocument, SourceKind,
    };
    pub use crate::domain::knowledge::{
        CanonicalEntity, Community, EntityType, GraphStore, Relationship, RelationshipType,
    };
    pub use crate::domain::memory::{
        ConversationFlush, ConversationMessage, FactLog, LearningEvent, LearningEventType,
        SyncWorker, WalState,
    };
    pub use crate::error::{Error, Result};
    pub use crate::infrastructure::graph::SqliteGraphStore;
}
