//! Domain layer
//!
//! The knowledge-graph model, the batch indexing pipeline and the
//! conversation memory sync path.

pub mod indexing;
pub mod knowledge;
pub mod memory;
