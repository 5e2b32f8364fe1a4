//! Batch indexing pipeline
//!
//! Turns course materials into the knowledge graph:
//!
//! - **Normalizer**: per-format adapters producing hashed chunks
//! - **Extractor**: schema-constrained extraction with gleaning passes
//! - **Resolver**: exact, embedding and adjudicated entity merging
//! - **Orchestrator**: full, incremental and staging runs over a corpus
//! - **Communities**: hierarchical Leiden clustering with summaries
//!
//! ## Usage
//!
//! ```rust,ignore
//! use coursegraph_core::domain::indexing::{Corpus, IndexMode, Orchestrator};
//!
//! let corpus = Corpus::from_dir("course/")?;
//! let report = orchestrator.run(&corpus, IndexMode::Incremental).await?;
//! println!("{} chunks processed", report.chunks_processed);
//! ```

pub mod chunk;
pub mod community;
pub mod extractor;
pub mod normalizer;
pub mod orchestrator;
pub mod resolver;

pub use chunk::{Chunk, ChunkBuilder, content_hash};
pub use community::{CommunityDetector, GraphSnapshot, LeidenClustering, LeidenConfig};
pub use extractor::{ExtractionOutput, Extractor};
pub use normalizer::{AdapterRegistry, Corpus, SourceAdapter, SourceDocument, SourceKind};
pub use orchestrator::{IndexMode, IndexingReport, Orchestrator, staging_selects};
pub use resolver::{
    CallGuard, EmbeddingCache, EntityResolver, MergeDecision, MergeTier, ResolutionOutcome, cosine_similarity,
};
