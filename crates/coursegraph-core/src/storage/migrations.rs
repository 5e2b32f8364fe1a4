//! Database migrations
//!
//! Versioned SQLite schema shared by the graph store and the fact log.
//! Migrations are applied automatically on database connection.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Version bookkeeping, created before anything else
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: Knowledge graph
const MIGRATION_V1: &str = r#"
    -- Canonical entities
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY NOT NULL,
        entity_type TEXT NOT NULL,
        display_name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        embedding TEXT,
        merge_confidence REAL NOT NULL DEFAULT 1.0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

    -- Aliases fold into the winning entity on merge
    CREATE TABLE IF NOT EXISTS entity_aliases (
        entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        entity_type TEXT NOT NULL,
        alias TEXT NOT NULL,
        normalized TEXT NOT NULL,
        PRIMARY KEY (entity_id, normalized)
    );

    CREATE INDEX IF NOT EXISTS idx_entity_aliases_normalized ON entity_aliases(normalized, entity_type);

    -- Chunks an entity was extracted from
    CREATE TABLE IF NOT EXISTS entity_evidence (
        entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        chunk_id TEXT NOT NULL,
        PRIMARY KEY (entity_id, chunk_id)
    );

    -- Typed edges between canonical entities
    CREATE TABLE IF NOT EXISTS relationships (
        id TEXT PRIMARY KEY NOT NULL,
        source_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        target_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
        rel_type TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (source_id, target_id, rel_type)
    );

    CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id);
    CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id);

    CREATE TABLE IF NOT EXISTS relationship_evidence (
        relationship_id TEXT NOT NULL REFERENCES relationships(id) ON DELETE CASCADE,
        chunk_id TEXT NOT NULL,
        PRIMARY KEY (relationship_id, chunk_id)
    );

    -- Last persisted content hashes per source, for incremental indexing
    CREATE TABLE IF NOT EXISTS chunk_hashes (
        source_id TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        indexed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (source_id, content_hash)
    );

    -- Community hierarchy
    CREATE TABLE IF NOT EXISTS communities (
        id TEXT PRIMARY KEY NOT NULL,
        level INTEGER NOT NULL CHECK (level >= 0),
        parent_id TEXT,
        summary TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_communities_level ON communities(level);

    CREATE TABLE IF NOT EXISTS community_members (
        community_id TEXT NOT NULL REFERENCES communities(id) ON DELETE CASCADE,
        entity_id TEXT NOT NULL,
        PRIMARY KEY (community_id, entity_id)
    );

    CREATE INDEX IF NOT EXISTS idx_community_members_entity ON community_members(entity_id);

    -- Learning events applied from the fact log, keyed for idempotent replay
    CREATE TABLE IF NOT EXISTS learning_events (
        idempotency_key TEXT PRIMARY KEY NOT NULL,
        event_id TEXT NOT NULL,
        student_id TEXT NOT NULL,
        concept_id TEXT NOT NULL REFERENCES entities(id),
        event_type TEXT NOT NULL CHECK (event_type IN ('MASTERED', 'STRUGGLING', 'REVIEWED', 'CONNECTION')),
        confidence REAL NOT NULL,
        evidence TEXT NOT NULL DEFAULT '',
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_learning_events_student ON learning_events(student_id);
    CREATE INDEX IF NOT EXISTS idx_learning_events_concept ON learning_events(concept_id);

    -- Pairs the adjudicator could not decide
    CREATE TABLE IF NOT EXISTS review_flags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        subject_a TEXT NOT NULL,
        subject_b TEXT NOT NULL,
        reason TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE (subject_a, subject_b)
    );
"#;

/// Migration 2: Durable fact log
const MIGRATION_V2: &str = r#"
    CREATE TABLE IF NOT EXISTS wal_records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        record_id TEXT NOT NULL UNIQUE,
        idempotency_key TEXT NOT NULL UNIQUE,
        payload TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'PENDING' CHECK (state IN ('PENDING', 'WRITING', 'COMMITTED', 'FAILED', 'DEAD_LETTER')),
        attempt_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        next_attempt_at INTEGER,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE INDEX IF NOT EXISTS idx_wal_records_state ON wal_records(state, seq);
"#;

/// Schema steps in order; a database at version `n` has applied the first `n`
const MIGRATIONS: &[(i32, &str, &str)] = &[
    (1, "knowledge graph", MIGRATION_V1),
    (2, "durable fact log", MIGRATION_V2),
];

async fn schema_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Apply every step above the stored version
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let from = schema_version(pool).await?;
    if from >= CURRENT_VERSION {
        tracing::debug!(version = from, "Schema up to date");
        return Ok(());
    }

    for &(version, name, sql) in MIGRATIONS.iter().filter(|(v, _, _)| *v > from) {
        tracing::info!(version, name, "Applying schema migration");
        sqlx::raw_sql(sql).execute(pool).await?;
        sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
            .bind(version)
            .execute(pool)
            .await?;
    }

    tracing::info!(from, to = CURRENT_VERSION, "Schema migrated");
    Ok(())
}

pub async fn needs_migration(pool: &SqlitePool) -> anyhow::Result<bool> {
    Ok(schema_version(pool).await? < CURRENT_VERSION)
}

pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = schema_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}
