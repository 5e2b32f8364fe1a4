//! Indexing orchestrator
//!
//! Drives normalize → extract → resolve → persist over a corpus, then
//! rebuilds the community hierarchy. Chunk hashes are written only after
//! a chunk's graph writes succeed, so an aborted run leaves exactly the
//! incomplete chunks to be picked up by the next incremental run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IndexingConfig;
use crate::domain::knowledge::{GraphStore, Relationship, normalize_name};
use crate::error::{Error, Result};

use super::chunk::Chunk;
use super::community::{CommunityDetector, GraphSnapshot};
use super::extractor::{ExtractionOutput, Extractor};
use super::normalizer::{AdapterRegistry, Corpus};
use super::resolver::{CallGuard, EmbeddingCache, EntityResolver, ResolutionOutcome};

/// How a run chooses which chunks to process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Reprocess every chunk
    Full,
    /// Skip chunks whose content hash is already persisted
    Incremental,
    /// Fully process a stable hash-selected sample of sources
    Staging,
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Staging => "staging",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "incremental" => Some(Self::Incremental),
            "staging" => Some(Self::Staging),
            _ => None,
        }
    }
}

impl std::fmt::Display for IndexMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one `run`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingReport {
    pub run_id: String,
    pub mode: IndexMode,
    pub sources_seen: usize,
    pub sources_selected: usize,
    /// Sources the normalizer could not read
    pub sources_failed: usize,
    pub chunks_seen: usize,
    /// Unchanged chunks skipped in incremental mode
    pub chunks_skipped: usize,
    pub chunks_processed: usize,
    /// Chunks whose extraction failed, timed out or was cancelled
    pub chunks_failed: usize,
    pub entities_extracted: usize,
    /// Extracted entities recorded as CONCEPT because their type was unknown
    pub entities_coerced: usize,
    pub entities_resolved: usize,
    pub relationships_written: usize,
    /// Every store upsert issued by this run
    pub graph_writes: usize,
    pub communities_built: usize,
    pub flagged_ambiguities: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IndexingReport {
    fn new(mode: IndexMode) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            mode,
            sources_seen: 0,
            sources_selected: 0,
            sources_failed: 0,
            chunks_seen: 0,
            chunks_skipped: 0,
            chunks_processed: 0,
            chunks_failed: 0,
            entities_extracted: 0,
            entities_coerced: 0,
            entities_resolved: 0,
            relationships_written: 0,
            graph_writes: 0,
            communities_built: 0,
            flagged_ambiguities: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Whether staging selects `source_id`; stable across processes
pub fn staging_selects(source_id: &str, modulus: u64) -> bool {
    if modulus <= 1 {
        return true;
    }
    let digest = Sha256::digest(source_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) % modulus == 0
}

/// A normalized source and the hashes already persisted for it
struct SourceWork {
    source_id: String,
    chunks: Vec<Chunk>,
    known_hashes: HashSet<String>,
}

/// Batch indexer over one graph store
pub struct Orchestrator {
    store: Arc<dyn GraphStore>,
    registry: Arc<AdapterRegistry>,
    extractor: Extractor,
    resolver: EntityResolver,
    detector: CommunityDetector,
    max_concurrency: usize,
    chunk_timeout: Duration,
    staging_modulus: u64,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        extractor: Extractor,
        resolver: EntityResolver,
        detector: CommunityDetector,
        config: &IndexingConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let chunk_timeout = config.chunk_timeout();
        Self {
            store,
            registry: Arc::new(AdapterRegistry::with_chunking(
                config.chunk_size_tokens,
                config.overlap_tokens(),
            )),
            extractor,
            resolver: resolver.with_call_guard(CallGuard::new(chunk_timeout, cancel.clone())),
            detector,
            max_concurrency: config.max_concurrency.max(1),
            chunk_timeout,
            staging_modulus: config.staging_sample_modulus,
            cancel,
        }
    }

    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Cancelling the token fails in-flight chunk extractions and cuts
    /// resolution short to the exact tier
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.resolver = self
            .resolver
            .with_call_guard(CallGuard::new(self.chunk_timeout, cancel.clone()));
        self.cancel = cancel;
        self
    }

    /// Index `corpus`
    ///
    /// A chunk that fails extraction is skipped and counted. A store
    /// failure aborts the run; chunks whose writes did not complete keep
    /// no hash and are retried by the next incremental run.
    pub async fn run(&self, corpus: &Corpus, mode: IndexMode) -> Result<IndexingReport> {
        let mut report = IndexingReport::new(mode);
        report.sources_seen = corpus.len();
        info!(run_id = %report.run_id, mode = %mode, sources = corpus.len(), "Indexing run starting");

        let work = self.prepare(corpus, mode, &mut report).await?;

        let pending: Vec<Chunk> = work
            .iter()
            .flat_map(|w| {
                w.chunks
                    .iter()
                    .filter(|c| mode != IndexMode::Incremental || !w.known_hashes.contains(&c.content_hash))
                    .cloned()
            })
            .collect();
        report.chunks_skipped = report.chunks_seen - pending.len();

        let extracted = self.extract_all(pending, &mut report).await;
        if !extracted.is_empty() {
            self.persist(&extracted, &mut report).await?;
        }

        let superseded = self.supersede_stale(&work).await?;
        report.graph_writes += superseded;

        if report.chunks_processed > 0 || superseded > 0 {
            self.rebuild_communities(&mut report).await?;
        }

        report.finished_at = Some(Utc::now());
        info!(
            run_id = %report.run_id,
            mode = %mode,
            chunks_seen = report.chunks_seen,
            chunks_skipped = report.chunks_skipped,
            chunks_processed = report.chunks_processed,
            chunks_failed = report.chunks_failed,
            entities = report.entities_resolved,
            coerced = report.entities_coerced,
            relationships = report.relationships_written,
            graph_writes = report.graph_writes,
            communities = report.communities_built,
            "Indexing run complete"
        );
        Ok(report)
    }

    /// Select sources, normalize them and load their persisted hashes
    async fn prepare(
        &self,
        corpus: &Corpus,
        mode: IndexMode,
        report: &mut IndexingReport,
    ) -> Result<Vec<SourceWork>> {
        let mut work = Vec::new();
        for doc in &corpus.sources {
            if mode == IndexMode::Staging && !staging_selects(&doc.source_id, self.staging_modulus) {
                continue;
            }
            report.sources_selected += 1;

            let chunks = match self.registry.normalize(doc) {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!(source_id = %doc.source_id, error = %e, "Skipping source that failed to normalize");
                    report.sources_failed += 1;
                    continue;
                }
            };
            report.chunks_seen += chunks.len();

            let known_hashes = self.store.chunk_hashes_for_source(&doc.source_id).await?;
            work.push(SourceWork {
                source_id: doc.source_id.clone(),
                chunks,
                known_hashes,
            });
        }
        Ok(work)
    }

    /// Fan extraction out over a bounded pool; results come back in chunk order
    async fn extract_all(
        &self,
        pending: Vec<Chunk>,
        report: &mut IndexingReport,
    ) -> Vec<(Chunk, ExtractionOutput)> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for chunk in pending {
            let semaphore = semaphore.clone();
            let extractor = self.extractor.clone();
            let cancel = self.cancel.clone();
            let limit = self.chunk_timeout;

            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        outcome = tokio::time::timeout(limit, extractor.extract(&chunk)) => {
                            outcome.unwrap_or_else(|_| {
                                Err(Error::Timeout(format!("Extraction of {} exceeded {:?}", chunk.id, limit)))
                            })
                        }
                    },
                    Err(_) => Err(Error::Cancelled),
                };
                (chunk, result)
            });
        }

        let mut extracted = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((chunk, Ok(output))) => extracted.push((chunk, output)),
                Ok((chunk, Err(e))) => {
                    warn!(chunk_id = %chunk.id, source_id = %chunk.source_id, error = %e, "Skipping chunk after extraction failure");
                    report.chunks_failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Extraction task aborted");
                    report.chunks_failed += 1;
                }
            }
        }
        extracted.sort_by(|a, b| {
            a.0.source_id
                .cmp(&b.0.source_id)
                .then(a.0.ordinal.cmp(&b.0.ordinal))
        });
        extracted
    }

    /// Resolve every candidate in one pass, then upsert and record hashes
    async fn persist(
        &self,
        extracted: &[(Chunk, ExtractionOutput)],
        report: &mut IndexingReport,
    ) -> Result<()> {
        let candidates: Vec<_> = extracted
            .iter()
            .flat_map(|(_, output)| output.entities.iter().cloned())
            .collect();
        report.entities_extracted += candidates.len();
        report.entities_coerced += extracted.iter().map(|(_, output)| output.coerced).sum::<usize>();

        let existing = self.store.list_entities().await?;
        let mut cache = EmbeddingCache::new();
        let outcome = self.resolver.resolve(&candidates, &existing, &mut cache).await?;
        debug!(hits = cache.hits(), misses = cache.misses(), "Embedding cache usage");

        for entity in &outcome.entities {
            self.store.upsert_entity(entity).await?;
            report.graph_writes += 1;
        }
        report.entities_resolved = outcome.entities.len();

        for flag in &outcome.review_flags {
            self.store.flag_for_review(flag).await?;
            report.graph_writes += 1;
        }
        report.flagged_ambiguities = outcome.review_flags.len();

        for relationship in resolve_relationships(extracted, &outcome).into_values() {
            self.store.upsert_relationship(&relationship).await?;
            report.graph_writes += 1;
            report.relationships_written += 1;
        }

        for (chunk, _) in extracted {
            self.store
                .record_chunk_hash(&chunk.source_id, &chunk.id, &chunk.content_hash)
                .await?;
            report.graph_writes += 1;
            report.chunks_processed += 1;
        }
        Ok(())
    }

    /// Drop hashes of chunks that no longer exist in their source
    async fn supersede_stale(&self, work: &[SourceWork]) -> Result<usize> {
        let mut superseded = 0;
        for source in work {
            let keep: HashSet<String> = source.chunks.iter().map(|c| c.content_hash.clone()).collect();
            if source.known_hashes.iter().all(|h| keep.contains(h)) {
                continue;
            }
            let dropped = self.store.supersede_chunk_hashes(&source.source_id, &keep).await?;
            debug!(source_id = %source.source_id, dropped, "Superseded stale chunk hashes");
            superseded += dropped as usize;
        }
        Ok(superseded)
    }

    async fn rebuild_communities(&self, report: &mut IndexingReport) -> Result<()> {
        let snapshot = GraphSnapshot {
            entities: self.store.list_entities().await?,
            relationships: self.store.list_relationships().await?,
        };
        let communities = self.detector.detect_and_summarize(&snapshot).await;
        self.store.replace_communities(&communities).await?;
        report.communities_built = communities.len();
        report.graph_writes += communities.len();
        Ok(())
    }
}

/// Map chunk-scoped relationships onto canonical ids, unioning evidence
fn resolve_relationships(
    extracted: &[(Chunk, ExtractionOutput)],
    outcome: &ResolutionOutcome,
) -> BTreeMap<String, Relationship> {
    let mut edges: BTreeMap<String, Relationship> = BTreeMap::new();

    for (chunk, output) in extracted {
        let types: HashMap<String, _> = output
            .entities
            .iter()
            .map(|e| (normalize_name(&e.name), e.entity_type))
            .collect();
        let lookup = |name: &str| {
            types
                .get(&normalize_name(name))
                .and_then(|t| outcome.canonical_id(*t, name))
                .or_else(|| outcome.canonical_id_by_name(name))
                .map(str::to_string)
        };

        for candidate in &output.relationships {
            let (Some(source), Some(target)) = (lookup(&candidate.source_name), lookup(&candidate.target_name))
            else {
                warn!(
                    chunk_id = %chunk.id,
                    source = %candidate.source_name,
                    target = %candidate.target_name,
                    "Dropping relationship with unresolved endpoint"
                );
                continue;
            };
            if source == target {
                debug!(chunk_id = %chunk.id, entity_id = %source, "Dropping relationship collapsed by merge");
                continue;
            }

            let edge = Relationship::new(source, target, candidate.rel_type);
            let entry = edges.entry(edge.id.clone()).or_insert(edge);
            if entry.description.is_empty() {
                entry.description = candidate.description.clone();
            }
            entry.evidence_chunk_ids.insert(chunk.id.clone());
        }
    }
    edges
}
