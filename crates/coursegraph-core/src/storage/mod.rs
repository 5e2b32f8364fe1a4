//! Storage layer - SQLite
//!
//! Provides database management and migrations for the graph store and the
//! durable fact log.
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use coursegraph_core::storage::{Database, DatabaseConfig};
//!
//! // In-memory graph for tests
//! let db = Database::in_memory().await?;
//!
//! // Fact log whose appends are fsynced before returning
//! let wal = Database::new(DatabaseConfig::durable("wal.db")).await?;
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};
