//! Three-tier entity resolution
//!
//! 1. Exact: same type and normalized name collapse immediately.
//! 2. Embedding: groups whose names embed above the similarity threshold
//!    merge, transitively, through a union-find.
//! 3. Adjudication: gray-band and cross-type pairs are put to an
//!    [`Adjudicator`]; anything short of a clear MERGE stays distinct and
//!    is flagged for review.
//!
//! Candidates are sorted before any decision is made, so the outcome does
//! not depend on input order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ResolutionConfig;
use crate::domain::knowledge::{
    AdjudicationSubject, Adjudicator, CandidateEntity, CanonicalEntity, EmbeddingClient,
    EntityType, ReviewFlag, Verdict, normalize_name,
};
use crate::error::{Error, Result};

const STOP_WORDS: &[&str] = &["the", "a", "an", "of", "in", "on", "at", "to", "for"];

/// Bonus for a representative that carries a description
const DESCRIPTION_BONUS: usize = 10;

/// Texts sent per embedding request
const EMBED_BATCH: usize = 128;

/// Run-scoped memo of embeddings, keyed by the embedded text
#[derive(Debug, Default)]
pub struct EmbeddingCache {
    vectors: HashMap<String, Vec<f32>>,
    hits: usize,
    misses: usize,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn misses(&self) -> usize {
        self.misses
    }

    /// Vectors for `texts` in order, embedding only what is not cached
    pub async fn embed_all(
        &mut self,
        client: &dyn EmbeddingClient,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let missing: Vec<String> = texts
            .iter()
            .filter(|t| !self.vectors.contains_key(*t))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        self.hits += texts.len() - missing.len();
        self.misses += missing.len();

        for batch in missing.chunks(EMBED_BATCH) {
            let vectors = client.embed(batch).await?;
            if vectors.len() != batch.len() {
                return Err(Error::EmbeddingFailed(format!(
                    "Expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                )));
            }
            for (text, vector) in batch.iter().zip(vectors) {
                self.vectors.insert(text.clone(), vector);
            }
        }

        texts
            .iter()
            .map(|t| {
                self.vectors
                    .get(t)
                    .cloned()
                    .ok_or_else(|| Error::EmbeddingFailed(format!("No vector for '{}'", t)))
            })
            .collect()
    }
}

/// Which tier produced a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeTier {
    Embedding,
    Adjudicated,
}

/// A merge between two groups of candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDecision {
    pub left: String,
    pub right: String,
    pub tier: MergeTier,
    pub confidence: f32,
    pub justification: Option<String>,
}

/// Result of one resolution run
#[derive(Debug, Clone, Default)]
pub struct ResolutionOutcome {
    /// Canonical entities touched by this run's candidates, sorted by id
    pub entities: Vec<CanonicalEntity>,
    /// Candidate key `(type, normalized name)` to canonical id
    pub assignments: BTreeMap<(EntityType, String), String>,
    pub merges: Vec<MergeDecision>,
    pub review_flags: Vec<ReviewFlag>,
    /// Candidates folded by the exact tier
    pub exact_merges: usize,
    /// Set when embeddings were unavailable and only the exact tier ran
    pub embedding_skipped: bool,
}

impl ResolutionOutcome {
    pub fn canonical_id(&self, entity_type: EntityType, name: &str) -> Option<&str> {
        self.assignments
            .get(&(entity_type, normalize_name(name)))
            .map(String::as_str)
    }

    /// Lookup by name alone; the lowest type wins when several match
    pub fn canonical_id_by_name(&self, name: &str) -> Option<&str> {
        let normalized = normalize_name(name);
        self.assignments
            .iter()
            .find(|((_, n), _)| *n == normalized)
            .map(|(_, id)| id.as_str())
    }
}

/// One exact-tier group: an existing entity, new candidates, or both
#[derive(Debug)]
struct Group {
    entity_type: EntityType,
    members: Vec<usize>,
    existing: Option<usize>,
    name: String,
    earliest_chunk: String,
}

/// Union-find that refuses to join two different stored entities
#[derive(Debug)]
struct Clusters {
    parent: Vec<usize>,
    existing: Vec<Option<usize>>,
    confidence: Vec<f32>,
}

impl Clusters {
    fn new(groups: &[Group]) -> Self {
        Self {
            parent: (0..groups.len()).collect(),
            existing: groups.iter().map(|g| g.existing).collect(),
            confidence: vec![1.0; groups.len()],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        while self.parent[x] != root {
            let next = self.parent[x];
            self.parent[x] = root;
            x = next;
        }
        root
    }

    fn same(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    fn blocked(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        matches!((self.existing[ra], self.existing[rb]), (Some(x), Some(y)) if x != y)
    }

    fn union(&mut self, a: usize, b: usize, confidence: f32) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb || self.blocked(ra, rb) {
            return false;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        self.existing[root] = self.existing[root].or(self.existing[child]);
        self.confidence[root] = self.confidence[root]
            .min(self.confidence[child])
            .min(confidence);
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct Pair {
    a: usize,
    b: usize,
    similarity: f32,
}

/// Deadline and cancellation applied to every embedding and adjudication call
#[derive(Debug, Clone)]
pub struct CallGuard {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl CallGuard {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    async fn run<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            outcome = tokio::time::timeout(self.timeout, call) => {
                outcome.unwrap_or_else(|_| Err(Error::Timeout(format!("{} exceeded {:?}", what, self.timeout))))
            }
        }
    }
}

/// Resolves candidate entities against each other and the stored graph
pub struct EntityResolver {
    embedder: Arc<dyn EmbeddingClient>,
    adjudicator: Option<Arc<dyn Adjudicator>>,
    guard: Option<CallGuard>,
    similarity_threshold: f32,
    gray_band_floor: f32,
}

impl EntityResolver {
    pub fn new(embedder: Arc<dyn EmbeddingClient>, config: &ResolutionConfig) -> Self {
        Self {
            embedder,
            adjudicator: None,
            guard: None,
            similarity_threshold: config.similarity_threshold,
            gray_band_floor: config.gray_band_floor.min(config.similarity_threshold),
        }
    }

    pub fn with_adjudicator(mut self, adjudicator: Arc<dyn Adjudicator>) -> Self {
        self.adjudicator = Some(adjudicator);
        self
    }

    /// Bound outbound calls; a timed-out or cancelled embedding pass
    /// degrades to the exact tier, an adjudication to a review flag
    pub fn with_call_guard(mut self, guard: CallGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    async fn guarded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match &self.guard {
            Some(guard) => guard.run(what, call).await,
            None => call.await,
        }
    }

    /// Resolve `candidates` into canonical entities
    ///
    /// `existing` entities seed the clusters so repeated runs converge on
    /// the same ids. Only clusters that received a candidate are returned.
    pub async fn resolve(
        &self,
        candidates: &[CandidateEntity],
        existing: &[CanonicalEntity],
        cache: &mut EmbeddingCache,
    ) -> Result<ResolutionOutcome> {
        let mut outcome = ResolutionOutcome::default();
        if candidates.is_empty() {
            return Ok(outcome);
        }

        let candidates = sorted_candidates(candidates);
        let mut existing: Vec<&CanonicalEntity> = existing.iter().collect();
        existing.sort_by(|a, b| a.id.cmp(&b.id));

        let groups = self.exact_tier(&candidates, &existing, &mut outcome);
        let mut clusters = Clusters::new(&groups);

        match self.group_vectors(&groups, &existing, cache).await {
            Ok(vectors) => {
                let (auto, ambiguous) = self.score_pairs(&groups, &vectors);
                self.embedding_tier(&groups, &auto, &mut clusters, &mut outcome);
                self.adjudication_tier(&groups, &candidates, &existing, &ambiguous, &mut clusters, &mut outcome)
                    .await;
                build_entities(&groups, &candidates, &existing, Some(&vectors), &mut clusters, &mut outcome);
            }
            Err(e) => {
                warn!(error = %e, "Embeddings unavailable; resolving by exact match only");
                outcome.embedding_skipped = true;
                build_entities(&groups, &candidates, &existing, None, &mut clusters, &mut outcome);
            }
        }

        info!(
            candidates = candidates.len(),
            groups = groups.len(),
            entities = outcome.entities.len(),
            exact_merges = outcome.exact_merges,
            merges = outcome.merges.len(),
            flagged = outcome.review_flags.len(),
            "Entity resolution complete"
        );
        Ok(outcome)
    }

    fn exact_tier(
        &self,
        candidates: &[CandidateEntity],
        existing: &[&CanonicalEntity],
        outcome: &mut ResolutionOutcome,
    ) -> Vec<Group> {
        let mut groups: Vec<Group> = Vec::new();
        let mut by_key: HashMap<(EntityType, String), usize> = HashMap::new();

        for (i, entity) in existing.iter().enumerate() {
            let index = groups.len();
            groups.push(Group {
                entity_type: entity.entity_type,
                members: Vec::new(),
                existing: Some(i),
                name: entity.display_name.clone(),
                earliest_chunk: entity.evidence_chunk_ids.iter().next().cloned().unwrap_or_default(),
            });
            for alias in &entity.aliases {
                by_key
                    .entry((entity.entity_type, normalize_name(alias)))
                    .or_insert(index);
            }
        }

        for (i, candidate) in candidates.iter().enumerate() {
            match by_key.get(&candidate.key()) {
                Some(&index) => {
                    groups[index].members.push(i);
                    if groups[index].members.len() > 1 || groups[index].existing.is_some() {
                        outcome.exact_merges += 1;
                    }
                }
                None => {
                    by_key.insert(candidate.key(), groups.len());
                    groups.push(Group {
                        entity_type: candidate.entity_type,
                        members: vec![i],
                        existing: None,
                        name: String::new(),
                        earliest_chunk: candidate.source_chunk_id.clone(),
                    });
                }
            }
        }

        for group in groups.iter_mut().filter(|g| g.existing.is_none()) {
            let members: Vec<&CandidateEntity> = group.members.iter().map(|&i| &candidates[i]).collect();
            group.name = representative(&members).map(|c| c.name.clone()).unwrap_or_default();
        }
        groups
    }

    /// One vector per group; stored embeddings are reused
    async fn group_vectors(
        &self,
        groups: &[Group],
        existing: &[&CanonicalEntity],
        cache: &mut EmbeddingCache,
    ) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = groups
            .iter()
            .filter(|g| stored_embedding(g, existing).is_none())
            .map(|g| g.name.clone())
            .collect();
        let mut fresh = self
            .guarded("Embedding pass", cache.embed_all(self.embedder.as_ref(), &texts))
            .await?
            .into_iter();

        let mut vectors = Vec::with_capacity(groups.len());
        for group in groups {
            match stored_embedding(group, existing) {
                Some(v) => vectors.push(v.clone()),
                None => vectors.push(fresh.next().unwrap_or_default()),
            }
        }
        Ok(vectors)
    }

    /// Split scored pairs into automatic merges and ones needing a decision
    fn score_pairs(&self, groups: &[Group], vectors: &[Vec<f32>]) -> (Vec<Pair>, Vec<Pair>) {
        let mut auto = Vec::new();
        let mut ambiguous = Vec::new();

        for a in 0..groups.len() {
            for b in (a + 1)..groups.len() {
                if groups[a].existing.is_some() && groups[b].existing.is_some() {
                    continue;
                }
                let similarity = cosine_similarity(&vectors[a], &vectors[b]);
                if similarity < self.gray_band_floor {
                    continue;
                }
                let pair = Pair { a, b, similarity };
                if groups[a].entity_type == groups[b].entity_type && similarity >= self.similarity_threshold {
                    auto.push(pair);
                } else {
                    ambiguous.push(pair);
                }
            }
        }

        auto.sort_by(|x, y| pair_order(groups, x, y));
        ambiguous.sort_by(|x, y| pair_order(groups, x, y));
        (auto, ambiguous)
    }

    fn embedding_tier(
        &self,
        groups: &[Group],
        pairs: &[Pair],
        clusters: &mut Clusters,
        outcome: &mut ResolutionOutcome,
    ) {
        for pair in pairs {
            if clusters.same(pair.a, pair.b) {
                continue;
            }
            if clusters.union(pair.a, pair.b, pair.similarity) {
                debug!(
                    left = %groups[pair.a].name,
                    right = %groups[pair.b].name,
                    similarity = pair.similarity,
                    "Embedding merge"
                );
                outcome.merges.push(MergeDecision {
                    left: groups[pair.a].name.clone(),
                    right: groups[pair.b].name.clone(),
                    tier: MergeTier::Embedding,
                    confidence: pair.similarity,
                    justification: None,
                });
            } else {
                debug!(
                    left = %groups[pair.a].name,
                    right = %groups[pair.b].name,
                    "Both sides are stored entities; not merging"
                );
            }
        }
    }

    async fn adjudication_tier(
        &self,
        groups: &[Group],
        candidates: &[CandidateEntity],
        existing: &[&CanonicalEntity],
        pairs: &[Pair],
        clusters: &mut Clusters,
        outcome: &mut ResolutionOutcome,
    ) {
        for pair in pairs {
            if clusters.same(pair.a, pair.b) || clusters.blocked(pair.a, pair.b) {
                continue;
            }
            let left = subject(&groups[pair.a], candidates, existing);
            let right = subject(&groups[pair.b], candidates, existing);

            let decision = match &self.adjudicator {
                Some(adjudicator) => {
                    self.guarded("Adjudication", adjudicator.adjudicate(&left, &right))
                        .await
                }
                None => Err(Error::ResolutionAmbiguity("no adjudicator configured".into())),
            };

            match decision {
                Ok(result) if result.verdict == Verdict::Merge => {
                    if clusters.union(pair.a, pair.b, pair.similarity) {
                        debug!(left = %left.name, right = %right.name, "Adjudicated merge");
                        outcome.merges.push(MergeDecision {
                            left: left.name.clone(),
                            right: right.name.clone(),
                            tier: MergeTier::Adjudicated,
                            confidence: pair.similarity,
                            justification: Some(result.justification),
                        });
                    }
                }
                Ok(result) if result.verdict == Verdict::Distinct => {
                    debug!(left = %left.name, right = %right.name, "Adjudicated distinct");
                }
                other => {
                    let reason = match other {
                        Ok(result) => result.justification,
                        Err(e) => e.to_string(),
                    };
                    let ambiguity = Error::ResolutionAmbiguity(format!(
                        "{} ({}) vs {} ({}) at similarity {:.3}: {}",
                        left.name, left.entity_type, right.name, right.entity_type, pair.similarity, reason
                    ));
                    warn!(code = ambiguity.code(), "{}; kept distinct", ambiguity);
                    outcome.review_flags.push(ReviewFlag::new(
                        subject_label(&left),
                        subject_label(&right),
                        ambiguity.to_string(),
                    ));
                }
            }
        }
    }
}

fn sorted_candidates(candidates: &[CandidateEntity]) -> Vec<CandidateEntity> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| {
        a.source_chunk_id
            .cmp(&b.source_chunk_id)
            .then_with(|| a.entity_type.cmp(&b.entity_type))
            .then_with(|| normalize_name(&a.name).cmp(&normalize_name(&b.name)))
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.description.cmp(&b.description))
    });
    sorted
}

fn stored_embedding<'a>(group: &Group, existing: &[&'a CanonicalEntity]) -> Option<&'a Vec<f32>> {
    group
        .existing
        .and_then(|i| existing[i].embedding.as_ref())
        .filter(|v| !v.is_empty())
}

/// Highest similarity first; ties by earliest chunk, then names
fn pair_order(groups: &[Group], x: &Pair, y: &Pair) -> Ordering {
    let key = |p: &Pair| {
        let (ga, gb) = (&groups[p.a], &groups[p.b]);
        let earliest = ga.earliest_chunk.as_str().min(gb.earliest_chunk.as_str());
        let (lo, hi) = if ga.name <= gb.name { (&ga.name, &gb.name) } else { (&gb.name, &ga.name) };
        (earliest, lo.as_str(), hi.as_str())
    };
    y.similarity
        .total_cmp(&x.similarity)
        .then_with(|| key(x).cmp(&key(y)))
}

fn subject(group: &Group, candidates: &[CandidateEntity], existing: &[&CanonicalEntity]) -> AdjudicationSubject {
    let description = match group.existing {
        Some(i) => existing[i].description.clone(),
        None => group
            .members
            .iter()
            .map(|&i| candidates[i].description.as_str())
            .find(|d| !d.is_empty())
            .unwrap_or_default()
            .to_string(),
    };
    AdjudicationSubject {
        name: group.name.clone(),
        entity_type: group.entity_type,
        description,
    }
}

fn subject_label(subject: &AdjudicationSubject) -> String {
    format!("{} ({})", subject.name, subject.entity_type)
}

/// Most descriptive name: characters outside stop words, plus a bonus for
/// a description; ties by earliest chunk, then lexical order
fn representative<'a>(members: &[&'a CandidateEntity]) -> Option<&'a CandidateEntity> {
    members.iter().copied().min_by(|a, b| {
        descriptiveness(b)
            .cmp(&descriptiveness(a))
            .then_with(|| a.source_chunk_id.cmp(&b.source_chunk_id))
            .then_with(|| a.name.cmp(&b.name))
    })
}

fn descriptiveness(candidate: &CandidateEntity) -> usize {
    let words: usize = candidate
        .name
        .split_whitespace()
        .filter(|w| !STOP_WORDS.contains(&w.to_lowercase().as_str()))
        .map(|w| w.chars().count())
        .sum();
    let bonus = if candidate.description.trim().is_empty() { 0 } else { DESCRIPTION_BONUS };
    words + bonus
}

/// Materialize one canonical entity per cluster that received candidates
fn build_entities(
    groups: &[Group],
    candidates: &[CandidateEntity],
    existing: &[&CanonicalEntity],
    vectors: Option<&[Vec<f32>]>,
    clusters: &mut Clusters,
    outcome: &mut ResolutionOutcome,
) {
    let mut by_root: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for g in 0..groups.len() {
        let root = clusters.find(g);
        by_root.entry(root).or_default().push(g);
    }

    for (root, members) in by_root {
        let member_candidates: Vec<&CandidateEntity> = members
            .iter()
            .flat_map(|&g| groups[g].members.iter().map(|&i| &candidates[i]))
            .collect();
        if member_candidates.is_empty() {
            continue;
        }

        let stored = clusters.existing[root].map(|i| existing[i]);
        let Some(rep) = representative(&member_candidates) else {
            continue;
        };
        let mut entity = match stored {
            Some(stored) => stored.clone(),
            None => CanonicalEntity::new(rep.name.clone(), rep.entity_type),
        };

        let mut surface_forms: BTreeMap<String, (&str, &str)> = BTreeMap::new();
        for c in &member_candidates {
            let slot = surface_forms
                .entry(normalize_name(&c.name))
                .or_insert((c.source_chunk_id.as_str(), c.name.as_str()));
            if (c.source_chunk_id.as_str(), c.name.as_str()) < *slot {
                *slot = (c.source_chunk_id.as_str(), c.name.as_str());
            }
        }
        let known: BTreeSet<String> = entity.aliases.iter().map(|a| normalize_name(a)).collect();
        for (normalized, (_, name)) in surface_forms {
            if !known.contains(&normalized) {
                entity.aliases.insert(name.to_string());
            }
        }
        entity
            .evidence_chunk_ids
            .extend(member_candidates.iter().map(|c| c.source_chunk_id.clone()));
        if entity.description.is_empty() {
            let mut ordered = member_candidates.clone();
            ordered.sort_by(|a, b| a.source_chunk_id.cmp(&b.source_chunk_id).then_with(|| a.name.cmp(&b.name)));
            let description = if rep.description.is_empty() {
                ordered.iter().map(|c| c.description.as_str()).find(|d| !d.is_empty())
            } else {
                Some(rep.description.as_str())
            };
            entity.description = description.unwrap_or_default().to_string();
        }
        entity.merge_confidence = entity.merge_confidence.min(clusters.confidence[root]);
        if entity.embedding.is_none() {
            if let Some(vectors) = vectors {
                let rep_group = members
                    .iter()
                    .copied()
                    .find(|&g| groups[g].members.iter().any(|&i| candidates[i].name == rep.name))
                    .unwrap_or(root);
                entity.embedding = Some(vectors[rep_group].clone()).filter(|v| !v.is_empty());
            }
        }

        for c in &member_candidates {
            outcome.assignments.insert(c.key(), entity.id.clone());
        }
        outcome.entities.push(entity);
    }

    outcome.entities.sort_by(|a, b| a.id.cmp(&b.id));
}

/// Cosine similarity; zero for mismatched or zero-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::AdjudicationOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Embeds names from a fixed table; unknown names get orthogonal vectors
    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
        calls: Mutex<usize>,
    }

    impl TableEmbedder {
        fn new(entries: &[(&str, Vec<f32>)]) -> Arc<Self> {
            Arc::new(Self {
                table: entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl EmbeddingClient for TableEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            *self.calls.lock().expect("lock") += 1;
            Ok(texts
                .iter()
                .map(|t| {
                    self.table.get(t).cloned().unwrap_or_else(|| {
                        let mut v = vec![0.0; 16];
                        v[t.len() % 16] = 1.0;
                        v
                    })
                })
                .collect())
        }
    }

    struct FixedAdjudicator(Verdict);

    #[async_trait]
    impl Adjudicator for FixedAdjudicator {
        async fn adjudicate(&self, _: &AdjudicationSubject, _: &AdjudicationSubject) -> Result<AdjudicationOutcome> {
            Ok(AdjudicationOutcome {
                verdict: self.0,
                justification: "fixed".into(),
            })
        }
    }

    fn config() -> ResolutionConfig {
        ResolutionConfig {
            similarity_threshold: 0.9,
            gray_band_floor: 0.8,
            ..ResolutionConfig::default()
        }
    }

    /// Unit vector at `angle` from the x axis; cos of the difference is the similarity
    fn at(angle: f32) -> Vec<f32> {
        vec![angle.cos(), angle.sin()]
    }

    fn cand(name: &str, t: EntityType, chunk: &str) -> CandidateEntity {
        CandidateEntity::new(name, t, chunk)
    }

    #[tokio::test]
    async fn test_exact_tier_merges_case_variants() {
        let resolver = EntityResolver::new(TableEmbedder::new(&[]), &config());
        let candidates = vec![
            cand("Raft", EntityType::Algorithm, "a#0"),
            cand("raft", EntityType::Algorithm, "b#0"),
            cand("Raft", EntityType::System, "b#0"),
        ];
        let outcome = resolver
            .resolve(&candidates, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");

        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.exact_merges, 1);
        let algo = outcome
            .entities
            .iter()
            .find(|e| e.entity_type == EntityType::Algorithm)
            .expect("algorithm");
        assert_eq!(algo.aliases.len(), 1);
        assert_eq!(algo.evidence_chunk_ids.len(), 2);
        assert_eq!(outcome.canonical_id(EntityType::Algorithm, "RAFT"), Some(algo.id.as_str()));
    }

    #[tokio::test]
    async fn test_embedding_tier_is_transitive() {
        // A~B = cos(0.3176) ~ 0.95, B~C = cos(0.3764) ~ 0.93, A~C ~ 0.77
        let embedder = TableEmbedder::new(&[
            ("Paxos", at(0.0)),
            ("Basic Paxos", at(0.3176)),
            ("Single-decree Paxos", at(0.694)),
        ]);
        let resolver = EntityResolver::new(embedder, &config());
        let candidates = vec![
            cand("Paxos", EntityType::Algorithm, "a#0"),
            cand("Basic Paxos", EntityType::Algorithm, "a#1"),
            cand("Single-decree Paxos", EntityType::Algorithm, "a#2"),
        ];
        let outcome = resolver
            .resolve(&candidates, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");

        assert_eq!(outcome.entities.len(), 1);
        let entity = &outcome.entities[0];
        let aliases: Vec<&str> = entity.aliases.iter().map(String::as_str).collect();
        assert_eq!(aliases, vec!["Basic Paxos", "Paxos", "Single-decree Paxos"]);
        assert_eq!(entity.display_name, "Single-decree Paxos");
        assert!(entity.merge_confidence < 0.95 && entity.merge_confidence > 0.9);
        assert_eq!(outcome.merges.len(), 2);
    }

    #[tokio::test]
    async fn test_gray_band_defaults_to_distinct_and_flags() {
        let embedder = TableEmbedder::new(&[("Paxos", at(0.0)), ("Multi-Paxos", at(0.55))]);
        let resolver = EntityResolver::new(embedder, &config());
        let candidates = vec![
            cand("Paxos", EntityType::Algorithm, "a#0"),
            cand("Multi-Paxos", EntityType::Algorithm, "a#1"),
        ];
        let outcome = resolver
            .resolve(&candidates, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.review_flags.len(), 1);
        assert!(outcome.review_flags[0].reason.contains("E200") || outcome.review_flags[0].reason.contains("ambiguous"));
    }

    #[tokio::test]
    async fn test_adjudicated_merge_and_distinct() {
        let table = [("Paxos", at(0.0)), ("Multi-Paxos", at(0.55))];
        let candidates = vec![
            cand("Paxos", EntityType::Algorithm, "a#0"),
            cand("Multi-Paxos", EntityType::Algorithm, "a#1"),
        ];

        let merge = EntityResolver::new(TableEmbedder::new(&table), &config())
            .with_adjudicator(Arc::new(FixedAdjudicator(Verdict::Merge)));
        let outcome = merge
            .resolve(&candidates, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");
        assert_eq!(outcome.entities.len(), 1);
        assert_eq!(outcome.merges[0].tier, MergeTier::Adjudicated);

        let distinct = EntityResolver::new(TableEmbedder::new(&table), &config())
            .with_adjudicator(Arc::new(FixedAdjudicator(Verdict::Distinct)));
        let outcome = distinct
            .resolve(&candidates, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");
        assert_eq!(outcome.entities.len(), 2);
        assert!(outcome.review_flags.is_empty());
    }

    #[tokio::test]
    async fn test_cross_type_never_auto_merges() {
        let embedder = TableEmbedder::new(&[("ZooKeeper", at(0.0)), ("Zookeeper service", at(0.01))]);
        let resolver = EntityResolver::new(embedder, &config());
        let candidates = vec![
            cand("ZooKeeper", EntityType::System, "a#0"),
            cand("Zookeeper service", EntityType::Concept, "a#1"),
        ];
        let outcome = resolver
            .resolve(&candidates, &[], &mut EmbeddingCache::new())
            .await
            .expect("resolve");
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.review_flags.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_entities_keep_ids_and_never_merge_each_other() {
        let mut raft = CanonicalEntity::new("Raft", EntityType::Algorithm);
        raft.embedding = Some(at(0.0));
        let mut raft2 = CanonicalEntity::new("Raft consensus", EntityType::Algorithm);
        raft2.embedding = Some(at(0.01));

        let embedder = TableEmbedder::new(&[("Raft algorithm", at(0.02))]);
        let resolver = EntityResolver::new(embedder, &config());
        let candidates = vec![
            cand("raft", EntityType::Algorithm, "b#0"),
            cand("Raft algorithm", EntityType::Algorithm, "b#1"),
        ];
        let outcome = resolver
            .resolve(&candidates, &[raft.clone(), raft2.clone()], &mut EmbeddingCache::new())
            .await
            .expect("resolve");

        // "Raft algorithm" sits closest to raft2; raft and raft2 stay apart
        let ids: Vec<&str> = outcome.entities.iter().map(|e| e.id.as_str()).collect();
        let mut expected = vec![raft.id.as_str(), raft2.id.as_str()];
        expected.sort();
        assert_eq!(ids, expected);
        assert_eq!(outcome.canonical_id(EntityType::Algorithm, "raft"), Some(raft.id.as_str()));
        assert_eq!(
            outcome.canonical_id(EntityType::Algorithm, "Raft algorithm"),
            Some(raft2.id.as_str())
        );
        let merged = outcome
            .entities
            .iter()
            .find(|e| e.id == raft2.id)
            .expect("raft2");
        assert!(merged.aliases.contains("Raft algorithm"));
        assert!(merged.evidence_chunk_ids.contains("b#1"));
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_exact_tier() {
        struct Down;
        #[async_trait]
        impl EmbeddingClient for Down {
            async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>> {
                Err(Error::EmbeddingFailed("offline".into()))
            }
        }
        let resolver = EntityResolver::new(Arc::new(Down), &config());
        let outcome = resolver
            .resolve(
                &[cand("Raft", EntityType::Algorithm, "a#0"), cand("RAFT", EntityType::Algorithm, "a#1")],
                &[],
                &mut EmbeddingCache::new(),
            )
            .await
            .expect("resolve");
        assert!(outcome.embedding_skipped);
        assert_eq!(outcome.entities.len(), 1);
        assert!(outcome.entities[0].embedding.is_none());
    }

    /// Never answers
    struct HungEmbedder;

    #[async_trait]
    impl EmbeddingClient for HungEmbedder {
        async fn embed(&self, _: &[String]) -> Result<Vec<Vec<f32>>> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_embedder_times_out_to_exact_tier() {
        let guard = CallGuard::new(Duration::from_secs(30), CancellationToken::new());
        let resolver = EntityResolver::new(Arc::new(HungEmbedder), &config()).with_call_guard(guard);
        let outcome = resolver
            .resolve(
                &[cand("Raft", EntityType::Algorithm, "a#0"), cand("raft", EntityType::Algorithm, "a#1")],
                &[],
                &mut EmbeddingCache::new(),
            )
            .await
            .expect("resolve");
        assert!(outcome.embedding_skipped);
        assert_eq!(outcome.entities.len(), 1);
        assert_eq!(outcome.exact_merges, 1);
    }

    #[tokio::test]
    async fn test_cancelled_guard_skips_embedding_and_adjudication() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let table = [("Paxos", at(0.0)), ("Multi-Paxos", at(0.55))];
        let resolver = EntityResolver::new(TableEmbedder::new(&table), &config())
            .with_adjudicator(Arc::new(FixedAdjudicator(Verdict::Merge)))
            .with_call_guard(CallGuard::new(Duration::from_secs(30), cancel));
        let outcome = resolver
            .resolve(
                &[cand("Paxos", EntityType::Algorithm, "a#0"), cand("Multi-Paxos", EntityType::Algorithm, "a#1")],
                &[],
                &mut EmbeddingCache::new(),
            )
            .await
            .expect("resolve");
        assert!(outcome.embedding_skipped);
        assert_eq!(outcome.entities.len(), 2);
        assert!(outcome.merges.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_adjudicator_is_flagged_not_merged() {
        struct Stalled;
        #[async_trait]
        impl Adjudicator for Stalled {
            async fn adjudicate(&self, _: &AdjudicationSubject, _: &AdjudicationSubject) -> Result<AdjudicationOutcome> {
                std::future::pending().await
            }
        }
        let table = [("Paxos", at(0.0)), ("Multi-Paxos", at(0.55))];
        let resolver = EntityResolver::new(TableEmbedder::new(&table), &config())
            .with_adjudicator(Arc::new(Stalled))
            .with_call_guard(CallGuard::new(Duration::from_secs(30), CancellationToken::new()));
        let outcome = resolver
            .resolve(
                &[cand("Paxos", EntityType::Algorithm, "a#0"), cand("Multi-Paxos", EntityType::Algorithm, "a#1")],
                &[],
                &mut EmbeddingCache::new(),
            )
            .await
            .expect("resolve");
        assert!(!outcome.embedding_skipped);
        assert_eq!(outcome.entities.len(), 2);
        assert_eq!(outcome.review_flags.len(), 1);
        assert!(outcome.review_flags[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_cache_skips_repeat_embeddings() {
        let embedder = TableEmbedder::new(&[]);
        let mut cache = EmbeddingCache::new();
        let texts = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        cache.embed_all(embedder.as_ref(), &texts).await.expect("embed");
        cache.embed_all(embedder.as_ref(), &texts).await.expect("embed");
        assert_eq!(*embedder.calls.lock().expect("lock"), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.misses(), 2);
    }

    #[test]
    fn test_representative_prefers_descriptive_names() {
        let a = cand("the Raft", EntityType::Algorithm, "x#1");
        let b = cand("Raft", EntityType::Algorithm, "x#0").with_description("consensus");
        let c = cand("Raft", EntityType::Algorithm, "x#2");
        assert_eq!(representative(&[&a, &b, &c]).map(|r| r.source_chunk_id.as_str()), Some("x#0"));
        assert_eq!(representative(&[&a, &c]).map(|r| r.source_chunk_id.as_str()), Some("x#1"));
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
