//! Shared fakes for the integration suites

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use coursegraph_core::config::{CommunityConfig, ExtractionConfig, IndexingConfig, ResolutionConfig};
use coursegraph_core::domain::indexing::{CommunityDetector, EntityResolver, Extractor, Orchestrator};
use coursegraph_core::domain::knowledge::{
    CanonicalEntity, Community, EmbeddingClient, EntityType, GraphStats, GraphStore, Relationship,
    ReviewFlag, StructuredCompletion,
};
use coursegraph_core::domain::memory::LearningEvent;
use coursegraph_core::infrastructure::graph::SqliteGraphStore;
use coursegraph_core::{Error, Result};

/// Text between the extraction prompt's TEXT fences
fn chunk_text(prompt: &str) -> String {
    prompt
        .split("TEXT:\n\"\"\"\n")
        .nth(1)
        .and_then(|rest| rest.split("\n\"\"\"").next())
        .unwrap_or_default()
        .to_lowercase()
}

/// Extracts the Raft vocabulary by keyword
pub struct RaftCompletion {
    pub calls: AtomicUsize,
}

impl RaftCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredCompletion for RaftCompletion {
    async fn complete(&self, prompt: &str, _schema: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = chunk_text(prompt);
        let mut entities = Vec::new();
        let mut relationships = Vec::new();

        if text.contains("raft") {
            entities.push(json!({"name": "Raft", "type": "ALGORITHM", "description": "A consensus algorithm"}));
        }
        if text.contains("paxos") {
            entities.push(json!({"name": "Paxos", "type": "ALGORITHM", "description": "Quorum-based consensus"}));
        }
        if text.contains("leader election") {
            entities.push(json!({"name": "leader election", "type": "PROTOCOL", "description": "Choosing a single leader"}));
            if text.contains("implement") {
                relationships.push(json!({"source": "Raft", "target": "leader election", "type": "IMPLEMENTS"}));
            }
        }
        if text.contains("strong consistency") {
            entities.push(json!({"name": "strong consistency", "type": "PROPERTY", "description": ""}));
            if text.contains("guarantees") {
                relationships.push(json!({"source": "Raft", "target": "strong consistency", "type": "GUARANTEES"}));
            }
        }
        Ok(json!({"entities": entities, "relationships": relationships}))
    }
}

/// Hash-spread vectors: distinct texts land far apart
pub struct DigestEmbedder;

#[async_trait]
impl EmbeddingClient for DigestEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                Sha256::digest(t.as_bytes())
                    .iter()
                    .map(|b| f32::from(*b) - 127.5)
                    .collect()
            })
            .collect())
    }
}

/// Wraps the SQLite store, counting writes and failing on demand
pub struct CountingStore {
    pub inner: SqliteGraphStore,
    pub writes: AtomicUsize,
    pub failing: AtomicBool,
    /// Writes allowed before `failing` takes effect, when set
    pub fail_after: AtomicUsize,
}

impl CountingStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteGraphStore::in_memory().await.expect("store"),
            writes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            fail_after: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn write(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        let before = self.writes.fetch_add(1, Ordering::SeqCst);
        if before >= self.fail_after.load(Ordering::SeqCst) {
            self.writes.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::StoreUnavailable("connection reset".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GraphStore for CountingStore {
    async fn health_check(&self) -> Result<()> {
        self.read()?;
        self.inner.health_check().await
    }

    async fn upsert_entity(&self, entity: &CanonicalEntity) -> Result<()> {
        self.write()?;
        self.inner.upsert_entity(entity).await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<CanonicalEntity>> {
        self.read()?;
        self.inner.get_entity(id).await
    }

    async fn find_entity_by_alias(&self, entity_type: Option<EntityType>, name: &str) -> Result<Option<CanonicalEntity>> {
        self.read()?;
        self.inner.find_entity_by_alias(entity_type, name).await
    }

    async fn list_entities(&self) -> Result<Vec<CanonicalEntity>> {
        self.read()?;
        self.inner.list_entities().await
    }

    async fn upsert_relationship(&self, relationship: &Relationship) -> Result<()> {
        self.write()?;
        self.inner.upsert_relationship(relationship).await
    }

    async fn get_relationship(&self, id: &str) -> Result<Option<Relationship>> {
        self.read()?;
        self.inner.get_relationship(id).await
    }

    async fn list_relationships(&self) -> Result<Vec<Relationship>> {
        self.read()?;
        self.inner.list_relationships().await
    }

    async fn chunk_hashes_for_source(&self, source_id: &str) -> Result<HashSet<String>> {
        self.read()?;
        self.inner.chunk_hashes_for_source(source_id).await
    }

    async fn record_chunk_hash(&self, source_id: &str, chunk_id: &str, content_hash: &str) -> Result<()> {
        self.write()?;
        self.inner.record_chunk_hash(source_id, chunk_id, content_hash).await
    }

    async fn supersede_chunk_hashes(&self, source_id: &str, keep: &HashSet<String>) -> Result<u64> {
        self.write()?;
        self.inner.supersede_chunk_hashes(source_id, keep).await
    }

    async fn replace_communities(&self, communities: &[Community]) -> Result<()> {
        self.write()?;
        self.inner.replace_communities(communities).await
    }

    async fn list_communities(&self) -> Result<Vec<Community>> {
        self.read()?;
        self.inner.list_communities().await
    }

    async fn apply_learning_event(&self, event: &LearningEvent, idempotency_key: &str) -> Result<bool> {
        self.write()?;
        self.inner.apply_learning_event(event, idempotency_key).await
    }

    async fn count_learning_events(&self) -> Result<u64> {
        self.read()?;
        self.inner.count_learning_events().await
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<()> {
        self.write()?;
        self.inner.flag_for_review(flag).await
    }

    async fn list_review_flags(&self) -> Result<Vec<ReviewFlag>> {
        self.read()?;
        self.inner.list_review_flags().await
    }

    async fn stats(&self) -> Result<GraphStats> {
        self.read()?;
        self.inner.stats().await
    }
}

pub fn resolver() -> EntityResolver {
    EntityResolver::new(Arc::new(DigestEmbedder), &ResolutionConfig::default())
}

pub fn orchestrator(store: Arc<dyn GraphStore>, completion: Arc<RaftCompletion>) -> Orchestrator {
    Orchestrator::new(
        store,
        Extractor::new(completion, &ExtractionConfig::default()),
        resolver(),
        CommunityDetector::new(&CommunityConfig::default()),
        &IndexingConfig::default(),
    )
}
