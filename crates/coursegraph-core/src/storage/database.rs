//! SQLite pools for the graph store and the fact log
//!
//! Both files share one schema; the fact log differs only in fsyncing
//! every commit.

use crate::storage::migrations;
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const FILE_POOL_SIZE: u32 = 5;
const MEMORY_PATH: &str = ":memory:";

/// How to open one SQLite file
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    /// Apply pending migrations on open
    pub auto_migrate: bool,
    pub journal_mode: SqliteJournalMode,
    pub synchronous: SqliteSynchronous,
}

impl DatabaseConfig {
    /// Graph database at `path`: WAL journal, NORMAL sync
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_connections: FILE_POOL_SIZE,
            auto_migrate: true,
            journal_mode: SqliteJournalMode::Wal,
            synchronous: SqliteSynchronous::Normal,
        }
    }

    /// Fact log at `path`: a commit returns only once SQLite has fsynced it
    pub fn durable(path: impl Into<PathBuf>) -> Self {
        Self {
            synchronous: SqliteSynchronous::Full,
            ..Self::with_path(path)
        }
    }

    /// Private in-memory database; one connection so every query sees it
    pub fn in_memory() -> Self {
        Self {
            max_connections: 1,
            journal_mode: SqliteJournalMode::Memory,
            ..Self::with_path(MEMORY_PATH)
        }
    }

    fn is_memory(&self) -> bool {
        self.path.as_os_str() == MEMORY_PATH
    }
}

/// An open, migrated SQLite pool
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    config: DatabaseConfig,
}

impl Database {
    /// Open the database, creating its directory and file as needed
    pub async fn new(config: DatabaseConfig) -> Result<Self> {
        if !config.is_memory() {
            if let Some(dir) = config.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Cannot create directory {}", dir.display()))?;
            }
        }

        let options = if config.is_memory() {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(true)
        }
        .journal_mode(config.journal_mode)
        .synchronous(config.synchronous)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("Cannot open SQLite database {}", config.path.display()))?;

        let db = Self { pool, config };
        if db.config.auto_migrate {
            db.migrate().await?;
        }

        tracing::debug!(
            path = %db.config.path.display(),
            synchronous = ?db.config.synchronous,
            "SQLite database ready"
        );
        Ok(db)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(DatabaseConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool)
            .await
            .context("Schema migration failed")
    }

    pub async fn migration_status(&self) -> Result<migrations::MigrationStatus> {
        migrations::migration_status(&self.pool)
            .await
            .context("Cannot read schema version")
    }

    /// Round-trip a trivial query
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("SQLite did not answer")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_database_is_migrated() {
        let db = Database::in_memory().await.expect("open");
        db.health_check().await.expect("healthy");
        assert!(!db.migration_status().await.expect("status").needs_migration);
        assert_eq!(db.path(), Path::new(MEMORY_PATH));
    }

    #[test]
    fn test_fact_log_config_fsyncs_every_commit() {
        let graph = DatabaseConfig::with_path("course/graph.db");
        let facts = DatabaseConfig::durable("course/facts.db");
        assert!(matches!(graph.synchronous, SqliteSynchronous::Normal));
        assert!(matches!(facts.synchronous, SqliteSynchronous::Full));
        assert!(matches!(facts.journal_mode, SqliteJournalMode::Wal));
        assert_eq!(facts.max_connections, graph.max_connections);
    }

    #[tokio::test]
    async fn test_foreign_keys_are_enforced() {
        let db = Database::in_memory().await.expect("open");
        let (enabled,): (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .expect("pragma");
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn test_chunk_hashes_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("graph.db");

        let db = Database::new(DatabaseConfig::with_path(&path))
            .await
            .expect("open database");
        sqlx::query("INSERT INTO chunk_hashes (source_id, content_hash, chunk_id) VALUES (?, ?, ?)")
            .bind("lecture1.txt")
            .bind("abc")
            .bind("lecture1.txt#0")
            .execute(db.pool())
            .await
            .expect("insert hash");
        db.close().await;

        let reopened = Database::new(DatabaseConfig::with_path(&path))
            .await
            .expect("reopen database");
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunk_hashes")
            .fetch_one(reopened.pool())
            .await
            .expect("count hashes");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_deleting_entity_drops_its_aliases() {
        let db = Database::in_memory().await.expect("open");

        sqlx::query("INSERT INTO entities (id, entity_type, display_name) VALUES (?, ?, ?)")
            .bind("e1")
            .bind("ALGORITHM")
            .bind("Raft")
            .execute(db.pool())
            .await
            .expect("insert entity");
        sqlx::query("INSERT INTO entity_aliases (entity_id, entity_type, alias, normalized) VALUES (?, ?, ?, ?)")
            .bind("e1")
            .bind("ALGORITHM")
            .bind("Raft")
            .bind("raft")
            .execute(db.pool())
            .await
            .expect("insert alias");

        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind("e1")
            .execute(db.pool())
            .await
            .expect("delete entity");

        let alias: Option<(String,)> = sqlx::query_as("SELECT alias FROM entity_aliases WHERE entity_id = ?")
            .bind("e1")
            .fetch_optional(db.pool())
            .await
            .expect("query alias");
        assert!(alias.is_none());
    }
}
