//! SQLite implementation of the GraphStore
//!
//! Every statement is a string literal with `?` placeholders; values only
//! ever reach SQLite as bound parameters.

use async_trait::async_trait;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info};

use crate::domain::knowledge::{
    CanonicalEntity, Community, EntityType, GraphStats, GraphStore, Relationship,
    RelationshipType, ReviewFlag, normalize_name,
};
use crate::domain::memory::LearningEvent;
use crate::error::{Error, Result};
use crate::storage::{Database, DatabaseConfig};

/// SQLite implementation of the graph store
#[derive(Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    /// Create a new store over an already-migrated pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a store over an open database
    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    /// Open (and migrate) a graph database file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::new(DatabaseConfig::with_path(path.as_ref()))
            .await
            .map_err(store_unavailable)?;
        Ok(Self::from_database(&db))
    }

    /// Open a fresh in-memory graph (useful for testing)
    pub async fn in_memory() -> Result<Self> {
        let db = Database::in_memory().await.map_err(store_unavailable)?;
        Ok(Self::from_database(&db))
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_aliases(&self, entity_id: &str) -> Result<BTreeSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT alias FROM entity_aliases WHERE entity_id = ? ORDER BY alias")
                .bind(entity_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(a,)| a).collect())
    }

    async fn load_entity_evidence(&self, entity_id: &str) -> Result<BTreeSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT chunk_id FROM entity_evidence WHERE entity_id = ? ORDER BY chunk_id")
                .bind(entity_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    async fn hydrate_entity(&self, row: EntityRow) -> Result<CanonicalEntity> {
        let aliases = self.load_aliases(&row.id).await?;
        let evidence = self.load_entity_evidence(&row.id).await?;
        row.into_entity(aliases, evidence)
    }
}

fn store_unavailable(e: anyhow::Error) -> Error {
    let chain: Vec<String> = e.chain().map(|c| c.to_string()).collect();
    Error::StoreUnavailable(chain.join(": "))
}

/// Write an entity with its aliases and evidence on an open connection
async fn write_entity(conn: &mut SqliteConnection, entity: &CanonicalEntity) -> Result<()> {
    let embedding_json = entity
        .embedding
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO entities (
            id, entity_type, display_name, description, embedding, merge_confidence
        ) VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            display_name = excluded.display_name,
            description = CASE
                WHEN excluded.description <> '' THEN excluded.description
                ELSE entities.description
            END,
            embedding = COALESCE(excluded.embedding, entities.embedding),
            merge_confidence = MIN(entities.merge_confidence, excluded.merge_confidence),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&entity.id)
    .bind(entity.entity_type.as_str())
    .bind(&entity.display_name)
    .bind(&entity.description)
    .bind(embedding_json)
    .bind(entity.merge_confidence as f64)
    .execute(&mut *conn)
    .await?;

    for alias in &entity.aliases {
        sqlx::query(
            "INSERT OR IGNORE INTO entity_aliases (entity_id, entity_type, alias, normalized) VALUES (?, ?, ?, ?)",
        )
        .bind(&entity.id)
        .bind(entity.entity_type.as_str())
        .bind(alias)
        .bind(normalize_name(alias))
        .execute(&mut *conn)
        .await?;
    }

    for chunk_id in &entity.evidence_chunk_ids {
        sqlx::query("INSERT OR IGNORE INTO entity_evidence (entity_id, chunk_id) VALUES (?, ?)")
            .bind(&entity.id)
            .bind(chunk_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(())
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    // ========== Entities ==========

    async fn upsert_entity(&self, entity: &CanonicalEntity) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_entity(&mut tx, entity).await?;
        tx.commit().await?;

        debug!(entity_id = %entity.id, entity_name = %entity.display_name, "Entity upserted");
        Ok(())
    }

    async fn get_entity(&self, id: &str) -> Result<Option<CanonicalEntity>> {
        let row: Option<EntityRow> = sqlx::query_as("SELECT * FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_entity(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_entity_by_alias(
        &self,
        entity_type: Option<EntityType>,
        name: &str,
    ) -> Result<Option<CanonicalEntity>> {
        let normalized = normalize_name(name);
        let row: Option<EntityRow> = match entity_type {
            Some(entity_type) => {
                sqlx::query_as(
                    r#"
                    SELECT e.* FROM entities e
                    JOIN entity_aliases a ON a.entity_id = e.id
                    WHERE a.normalized = ? AND a.entity_type = ?
                    ORDER BY e.id
                    LIMIT 1
                    "#,
                )
                .bind(&normalized)
                .bind(entity_type.as_str())
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT e.* FROM entities e
                    JOIN entity_aliases a ON a.entity_id = e.id
                    WHERE a.normalized = ?
                    ORDER BY e.id
                    LIMIT 1
                    "#,
                )
                .bind(&normalized)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        match row {
            Some(row) => Ok(Some(self.hydrate_entity(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_entities(&self) -> Result<Vec<CanonicalEntity>> {
        let rows: Vec<EntityRow> = sqlx::query_as("SELECT * FROM entities ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut aliases: HashMap<String, BTreeSet<String>> = HashMap::new();
        let alias_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT entity_id, alias FROM entity_aliases")
                .fetch_all(&self.pool)
                .await?;
        for (entity_id, alias) in alias_rows {
            aliases.entry(entity_id).or_default().insert(alias);
        }

        let mut evidence: HashMap<String, BTreeSet<String>> = HashMap::new();
        let evidence_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT entity_id, chunk_id FROM entity_evidence")
                .fetch_all(&self.pool)
                .await?;
        for (entity_id, chunk_id) in evidence_rows {
            evidence.entry(entity_id).or_default().insert(chunk_id);
        }

        rows.into_iter()
            .map(|row| {
                let a = aliases.remove(&row.id).unwrap_or_default();
                let e = evidence.remove(&row.id).unwrap_or_default();
                row.into_entity(a, e)
            })
            .collect()
    }

    // ========== Relationships ==========

    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO relationships (id, source_id, target_id, rel_type, description)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                description = CASE
                    WHEN excluded.description <> '' THEN excluded.description
                    ELSE relationships.description
                END,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&relationship.id)
        .bind(&relationship.source_id)
        .bind(&relationship.target_id)
        .bind(relationship.rel_type.as_str())
        .bind(&relationship.description)
        .execute(&mut *tx)
        .await?;

        for chunk_id in &relationship.evidence_chunk_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO relationship_evidence (relationship_id, chunk_id) VALUES (?, ?)",
            )
            .bind(&relationship.id)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            relationship_id = %relationship.id,
            rel_type = %relationship.rel_type,
            evidence = relationship.evidence_chunk_ids.len(),
            "Relationship upserted"
        );
        Ok(())
    }

    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>> {
        let row: Option<RelationshipRow> = sqlx::query_as(
            "SELECT id, source_id, target_id, rel_type, description FROM relationships WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let evidence: Vec<(String,)> = sqlx::query_as(
            "SELECT chunk_id FROM relationship_evidence WHERE relationship_id = ? ORDER BY chunk_id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        row.into_relationship(evidence.into_iter().map(|(c,)| c).collect())
            .map(Some)
    }

    async fn list_relationships(&self) -> Result<Vec<Relationship>> {
        let rows: Vec<RelationshipRow> = sqlx::query_as(
            "SELECT id, source_id, target_id, rel_type, description FROM relationships ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut evidence: HashMap<String, BTreeSet<String>> = HashMap::new();
        let evidence_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT relationship_id, chunk_id FROM relationship_evidence")
                .fetch_all(&self.pool)
                .await?;
        for (relationship_id, chunk_id) in evidence_rows {
            evidence.entry(relationship_id).or_default().insert(chunk_id);
        }

        rows.into_iter()
            .map(|row| {
                let e = evidence.remove(&row.id).unwrap_or_default();
                row.into_relationship(e)
            })
            .collect()
    }

    // ========== Change detection ==========

    async fn chunk_hashes_for_source(&self, source_id: &str) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT content_hash FROM chunk_hashes WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(h,)| h).collect())
    }

    async fn record_chunk_hash(&self, source_id: &str, chunk_id: &str, content_hash: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_hashes (source_id, content_hash, chunk_id)
            VALUES (?, ?, ?)
            ON CONFLICT(source_id, content_hash) DO UPDATE SET
                chunk_id = excluded.chunk_id,
                indexed_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(source_id)
        .bind(content_hash)
        .bind(chunk_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn supersede_chunk_hashes(&self, source_id: &str, keep: &HashSet<String>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT content_hash FROM chunk_hashes WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&mut *tx)
                .await?;

        let mut dropped = 0;
        for (hash,) in rows {
            if keep.contains(&hash) {
                continue;
            }
            let result = sqlx::query("DELETE FROM chunk_hashes WHERE source_id = ? AND content_hash = ?")
                .bind(source_id)
                .bind(&hash)
                .execute(&mut *tx)
                .await?;
            dropped += result.rows_affected();
        }

        tx.commit().await?;

        if dropped > 0 {
            debug!(source_id = %source_id, dropped, "Superseded chunk hashes");
        }
        Ok(dropped)
    }

    // ========== Communities ==========

    async fn replace_communities(&self, communities: &[Community]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM community_members")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM communities").execute(&mut *tx).await?;

        for community in communities {
            sqlx::query("INSERT INTO communities (id, level, parent_id, summary) VALUES (?, ?, ?, ?)")
                .bind(&community.id)
                .bind(community.level as i64)
                .bind(&community.parent_id)
                .bind(&community.summary)
                .execute(&mut *tx)
                .await?;

            for entity_id in &community.member_entity_ids {
                sqlx::query("INSERT INTO community_members (community_id, entity_id) VALUES (?, ?)")
                    .bind(&community.id)
                    .bind(entity_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        info!(communities = communities.len(), "Community hierarchy replaced");
        Ok(())
    }

    async fn list_communities(&self) -> Result<Vec<Community>> {
        let rows: Vec<CommunityRow> =
            sqlx::query_as("SELECT id, level, parent_id, summary FROM communities ORDER BY level, id")
                .fetch_all(&self.pool)
                .await?;

        let mut members: HashMap<String, BTreeSet<String>> = HashMap::new();
        let member_rows: Vec<(String, String)> =
            sqlx::query_as("SELECT community_id, entity_id FROM community_members")
                .fetch_all(&self.pool)
                .await?;
        for (community_id, entity_id) in member_rows {
            members.entry(community_id).or_default().insert(entity_id);
        }

        Ok(rows
            .into_iter()
            .map(|row| Community {
                member_entity_ids: members.remove(&row.id).unwrap_or_default(),
                id: row.id,
                level: row.level as u32,
                summary: row.summary,
                parent_id: row.parent_id,
            })
            .collect())
    }

    // ========== Learning events ==========

    async fn apply_learning_event(&self, event: &LearningEvent, idempotency_key: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let seen: Option<(String,)> =
            sqlx::query_as("SELECT event_id FROM learning_events WHERE idempotency_key = ?")
                .bind(idempotency_key)
                .fetch_optional(&mut *tx)
                .await?;
        if seen.is_some() {
            tx.commit().await?;
            debug!(idempotency_key = %idempotency_key, "Learning event already applied");
            return Ok(false);
        }

        let normalized = normalize_name(&event.concept_name);
        let existing: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT e.id FROM entities e
            JOIN entity_aliases a ON a.entity_id = e.id
            WHERE a.normalized = ?
            ORDER BY CASE WHEN e.entity_type = 'CONCEPT' THEN 0 ELSE 1 END, e.id
            LIMIT 1
            "#,
        )
        .bind(&normalized)
        .fetch_optional(&mut *tx)
        .await?;

        let concept_id = match existing {
            Some((id,)) => id,
            None => {
                let concept = CanonicalEntity::new(event.concept_name.trim(), EntityType::Concept);
                write_entity(&mut tx, &concept).await?;
                concept.id
            }
        };

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO learning_events (
                idempotency_key, event_id, student_id, concept_id,
                event_type, confidence, evidence
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(idempotency_key)
        .bind(&event.event_id)
        .bind(&event.student_id)
        .bind(&concept_id)
        .bind(event.event_type.as_str())
        .bind(event.confidence as f64)
        .bind(&event.evidence)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let applied = result.rows_affected() == 1;
        debug!(
            idempotency_key = %idempotency_key,
            concept_id = %concept_id,
            event_type = %event.event_type,
            applied,
            "Learning event applied"
        );
        Ok(applied)
    }

    async fn count_learning_events(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM learning_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    // ========== Review ==========

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO review_flags (subject_a, subject_b, reason) VALUES (?, ?, ?)
            ON CONFLICT(subject_a, subject_b) DO NOTHING
            "#,
        )
        .bind(&flag.subject_a)
        .bind(&flag.subject_b)
        .bind(&flag.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_review_flags(&self) -> Result<Vec<ReviewFlag>> {
        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT subject_a, subject_b, reason FROM review_flags ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(subject_a, subject_b, reason)| ReviewFlag {
                subject_a,
                subject_b,
                reason,
            })
            .collect())
    }

    async fn stats(&self) -> Result<GraphStats> {
        let (entities,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entities")
            .fetch_one(&self.pool)
            .await?;
        let (relationships,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relationships")
            .fetch_one(&self.pool)
            .await?;
        let (communities,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM communities")
            .fetch_one(&self.pool)
            .await?;
        let (learning_events,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM learning_events")
            .fetch_one(&self.pool)
            .await?;
        let (review_flags,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM review_flags")
            .fetch_one(&self.pool)
            .await?;

        Ok(GraphStats {
            entities: entities as u64,
            relationships: relationships as u64,
            communities: communities as u64,
            learning_events: learning_events as u64,
            review_flags: review_flags as u64,
        })
    }
}

// ========== Database Row Types ==========

#[derive(Debug, FromRow)]
struct EntityRow {
    id: String,
    entity_type: String,
    display_name: String,
    description: String,
    embedding: Option<String>,
    merge_confidence: f64,
}

impl EntityRow {
    fn into_entity(
        self,
        aliases: BTreeSet<String>,
        evidence_chunk_ids: BTreeSet<String>,
    ) -> Result<CanonicalEntity> {
        let entity_type = EntityType::parse(&self.entity_type)
            .ok_or_else(|| Error::InvalidInput(["stored entity type ", &self.entity_type].concat()))?;

        let embedding = self
            .embedding
            .as_deref()
            .map(serde_json::from_str::<Vec<f32>>)
            .transpose()?;

        Ok(CanonicalEntity {
            id: self.id,
            entity_type,
            display_name: self.display_name,
            description: self.description,
            aliases,
            embedding,
            merge_confidence: self.merge_confidence as f32,
            evidence_chunk_ids,
        })
    }
}

#[derive(Debug, FromRow)]
struct RelationshipRow {
    id: String,
    source_id: String,
    target_id: String,
    rel_type: String,
    description: String,
}

impl RelationshipRow {
    fn into_relationship(self, evidence_chunk_ids: BTreeSet<String>) -> Result<Relationship> {
        let rel_type = RelationshipType::parse(&self.rel_type)
            .ok_or_else(|| Error::InvalidInput(["stored relationship type ", &self.rel_type].concat()))?;

        Ok(Relationship {
            id: self.id,
            source_id: self.source_id,
            target_id: self.target_id,
            rel_type,
            description: self.description,
            evidence_chunk_ids,
        })
    }
}

#[derive(Debug, FromRow)]
struct CommunityRow {
    id: String,
    level: i64,
    parent_id: Option<String>,
    summary: String,
}
