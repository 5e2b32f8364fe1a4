//! Knowledge graph infrastructure implementations
//!
//! This module contains the SQLite implementation of the graph store trait.

mod repository;

pub use repository::SqliteGraphStore;
