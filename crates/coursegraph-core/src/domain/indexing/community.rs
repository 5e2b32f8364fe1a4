//! Hierarchical community detection
//!
//! Leiden-style clustering over the resolved entity graph:
//!
//! 1. **Local moving**: visit nodes in a seeded random order, moving each to
//!    the neighbouring community with the best modularity gain.
//! 2. **Refinement**: split any community that is not connected into its
//!    connected components.
//! 3. **Aggregation**: collapse each community into a super-node and repeat
//!    on the smaller graph, producing the next level.
//!
//! Levels stop when aggregation no longer merges anything. Node order is
//! fixed by entity id and neighbour scans are ordered, so the same graph,
//! resolution and seed always give the same partition.
//!
//! Modularity with resolution γ:
//!
//! Q = (1/2m) Σ_c [ in(c) − γ · tot(c)² / 2m ]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::CommunityConfig;
use crate::domain::knowledge::{
    CanonicalEntity, Community, CommunityMember, CommunitySummarizer, Relationship,
};

/// Leiden parameters
#[derive(Debug, Clone)]
pub struct LeidenConfig {
    /// Higher values give more, smaller communities
    pub resolution: f64,
    pub seed: u64,
    /// Local-moving rounds per level
    pub max_iterations: usize,
    /// Smallest modularity improvement worth another round
    pub min_modularity_gain: f64,
    pub max_levels: usize,
}

impl Default for LeidenConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            seed: 42,
            max_iterations: 50,
            min_modularity_gain: 1e-6,
            max_levels: 5,
        }
    }
}

impl From<&CommunityConfig> for LeidenConfig {
    fn from(config: &CommunityConfig) -> Self {
        Self {
            resolution: config.resolution,
            seed: config.seed,
            max_iterations: config.max_iterations,
            min_modularity_gain: config.min_modularity_gain,
            max_levels: config.max_levels.max(1),
        }
    }
}

/// The entity graph as read from the store
#[derive(Debug, Clone, Default)]
pub struct GraphSnapshot {
    pub entities: Vec<CanonicalEntity>,
    pub relationships: Vec<Relationship>,
}

/// Undirected weighted graph; self loops carry internal weight after
/// aggregation and are stored doubled
#[derive(Debug, Clone)]
struct WeightedGraph {
    adjacency: Vec<BTreeMap<usize, f64>>,
    degrees: Vec<f64>,
    /// 2m
    total: f64,
}

impl WeightedGraph {
    fn from_edges(n: usize, edges: impl IntoIterator<Item = (usize, usize, f64)>) -> Self {
        let mut adjacency = vec![BTreeMap::new(); n];
        for (a, b, w) in edges {
            if a == b {
                *adjacency[a].entry(a).or_insert(0.0) += 2.0 * w;
            } else {
                *adjacency[a].entry(b).or_insert(0.0) += w;
                *adjacency[b].entry(a).or_insert(0.0) += w;
            }
        }
        let degrees: Vec<f64> = adjacency.iter().map(|row| row.values().sum()).collect();
        let total = degrees.iter().sum();
        Self {
            adjacency,
            degrees,
            total,
        }
    }

    fn len(&self) -> usize {
        self.adjacency.len()
    }

    /// Collapse communities into super-nodes
    fn aggregate(&self, membership: &[usize], count: usize) -> Self {
        let mut adjacency = vec![BTreeMap::new(); count];
        for (node, row) in self.adjacency.iter().enumerate() {
            for (&neighbor, &w) in row {
                *adjacency[membership[node]]
                    .entry(membership[neighbor])
                    .or_insert(0.0) += w;
            }
        }
        let degrees: Vec<f64> = adjacency.iter().map(|row: &BTreeMap<usize, f64>| row.values().sum()).collect();
        Self {
            adjacency,
            degrees,
            total: self.total,
        }
    }
}

/// Leiden clustering over one graph
#[derive(Debug, Clone)]
pub struct LeidenClustering {
    config: LeidenConfig,
}

impl LeidenClustering {
    pub fn new(config: LeidenConfig) -> Self {
        Self { config }
    }

    /// Partition `graph` at the given resolution; labels are contiguous and
    /// numbered by first appearance in node order
    fn partition(&self, graph: &WeightedGraph, resolution: f64, rng: &mut StdRng) -> Vec<usize> {
        let n = graph.len();
        let mut membership: Vec<usize> = (0..n).collect();
        if graph.total == 0.0 {
            return membership;
        }

        for iteration in 0..self.config.max_iterations {
            let before = modularity(graph, &membership, resolution);
            let moved = self.local_moving(graph, &mut membership, resolution, rng);
            refine(graph, &mut membership);
            membership = renumber(&membership).0;
            let after = modularity(graph, &membership, resolution);

            debug!(iteration, moved, modularity = after, "Leiden round");
            if !moved || after - before < self.config.min_modularity_gain {
                break;
            }
        }
        membership
    }

    fn local_moving(
        &self,
        graph: &WeightedGraph,
        membership: &mut [usize],
        resolution: f64,
        rng: &mut StdRng,
    ) -> bool {
        let n = graph.len();
        let two_m = graph.total;
        let mut totals = vec![0.0; n];
        for (node, &c) in membership.iter().enumerate() {
            totals[c] += graph.degrees[node];
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);

        let mut improved = false;
        for node in order {
            let current = membership[node];
            let degree = graph.degrees[node];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            links.insert(current, 0.0);
            for (&neighbor, &w) in &graph.adjacency[node] {
                if neighbor != node {
                    *links.entry(membership[neighbor]).or_insert(0.0) += w;
                }
            }

            totals[current] -= degree;
            let gain = |community: usize, weight: f64| weight - resolution * totals[community] * degree / two_m;

            let stay = gain(current, links[&current]);
            let mut best = current;
            let mut best_gain = stay;
            for (&community, &weight) in &links {
                let g = gain(community, weight);
                if g > best_gain + 1e-12 {
                    best = community;
                    best_gain = g;
                }
            }

            totals[best] += degree;
            if best != current {
                membership[node] = best;
                improved = true;
            }
        }
        improved
    }
}

/// Split communities into connected components
fn refine(graph: &WeightedGraph, membership: &mut [usize]) {
    let n = graph.len();
    let mut assigned = vec![usize::MAX; n];
    let mut next = 0;

    for start in 0..n {
        if assigned[start] != usize::MAX {
            continue;
        }
        let community = membership[start];
        assigned[start] = next;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for (&neighbor, &w) in &graph.adjacency[node] {
                if w > 0.0 && assigned[neighbor] == usize::MAX && membership[neighbor] == community {
                    assigned[neighbor] = next;
                    stack.push(neighbor);
                }
            }
        }
        next += 1;
    }
    membership.copy_from_slice(&assigned);
}

/// Contiguous labels in order of first appearance, plus the label count
fn renumber(membership: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let labels = membership
        .iter()
        .map(|&c| {
            let next = mapping.len();
            *mapping.entry(c).or_insert(next)
        })
        .collect();
    (labels, mapping.len())
}

fn modularity(graph: &WeightedGraph, membership: &[usize], resolution: f64) -> f64 {
    if graph.total == 0.0 {
        return 0.0;
    }
    let mut internal: HashMap<usize, f64> = HashMap::new();
    let mut totals: HashMap<usize, f64> = HashMap::new();
    for (node, row) in graph.adjacency.iter().enumerate() {
        let c = membership[node];
        *totals.entry(c).or_insert(0.0) += graph.degrees[node];
        for (&neighbor, &w) in row {
            if membership[neighbor] == c {
                *internal.entry(c).or_insert(0.0) += w;
            }
        }
    }
    let two_m = graph.total;
    totals
        .iter()
        .map(|(c, tot)| internal.get(c).copied().unwrap_or(0.0) - resolution * tot * tot / two_m)
        .sum::<f64>()
        / two_m
}

/// Detects and summarizes the community hierarchy
pub struct CommunityDetector {
    leiden: LeidenClustering,
    summarizer: Option<Arc<dyn CommunitySummarizer>>,
    summary_member_limit: usize,
}

impl CommunityDetector {
    pub fn new(config: &CommunityConfig) -> Self {
        Self {
            leiden: LeidenClustering::new(LeidenConfig::from(config)),
            summarizer: None,
            summary_member_limit: config.summary_member_limit.max(1),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn CommunitySummarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn config(&self) -> &LeidenConfig {
        &self.leiden.config
    }

    /// Build the hierarchy without summaries
    ///
    /// Level 0 partitions every entity; each higher level partitions the
    /// level below it. Community ids are `com_L{level}_{ordinal}`.
    pub fn detect(&self, snapshot: &GraphSnapshot, resolution: f64) -> Vec<Community> {
        let mut ids: Vec<&str> = snapshot.entities.iter().map(|e| e.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Vec::new();
        }
        let index: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let edges = snapshot.relationships.iter().filter_map(|r| {
            let a = *index.get(r.source_id.as_str())?;
            let b = *index.get(r.target_id.as_str())?;
            (a != b).then(|| (a, b, r.evidence_chunk_ids.len().max(1) as f64))
        });
        let mut graph = WeightedGraph::from_edges(ids.len(), edges);

        // Entity index -> community ordinal at the current level
        let mut entity_membership: Vec<usize> = (0..ids.len()).collect();
        let mut levels: Vec<(Vec<usize>, usize)> = Vec::new();

        for level in 0..self.leiden.config.max_levels {
            let mut rng = StdRng::seed_from_u64(self.leiden.config.seed.wrapping_add(level as u64));
            let (membership, count) = renumber(&self.leiden.partition(&graph, resolution, &mut rng));

            if level > 0 && count == graph.len() {
                break;
            }
            entity_membership = entity_membership.iter().map(|&node| membership[node]).collect();
            levels.push((entity_membership.clone(), count));

            if count <= 1 {
                break;
            }
            graph = graph.aggregate(&membership, count);
        }

        let mut communities = Vec::new();
        for (level, (membership, count)) in levels.iter().enumerate() {
            let mut members: Vec<BTreeSet<String>> = vec![BTreeSet::new(); *count];
            for (entity, &c) in membership.iter().enumerate() {
                members[c].insert(ids[entity].to_string());
            }

            for (ordinal, member_entity_ids) in members.into_iter().enumerate() {
                // Any member's community one level up is the parent
                let parent_id = levels.get(level + 1).and_then(|(above, _)| {
                    membership
                        .iter()
                        .position(|&c| c == ordinal)
                        .map(|entity| Community::id_for(level as u32 + 1, above[entity]))
                });
                communities.push(Community {
                    id: Community::id_for(level as u32, ordinal),
                    level: level as u32,
                    member_entity_ids,
                    summary: String::new(),
                    parent_id,
                });
            }
        }

        info!(
            entities = ids.len(),
            levels = levels.len(),
            communities = communities.len(),
            "Community hierarchy built"
        );
        communities
    }

    /// Build the hierarchy at the configured resolution and summarize it
    pub async fn detect_and_summarize(&self, snapshot: &GraphSnapshot) -> Vec<Community> {
        let mut communities = self.detect(snapshot, self.leiden.config.resolution);
        let entities: HashMap<&str, &CanonicalEntity> =
            snapshot.entities.iter().map(|e| (e.id.as_str(), e)).collect();

        let mut degree: HashMap<&str, usize> = HashMap::new();
        for r in &snapshot.relationships {
            *degree.entry(r.source_id.as_str()).or_default() += 1;
            *degree.entry(r.target_id.as_str()).or_default() += 1;
        }

        for community in &mut communities {
            let mut members: Vec<&CanonicalEntity> = community
                .member_entity_ids
                .iter()
                .filter_map(|id| entities.get(id.as_str()).copied())
                .collect();
            members.sort_by(|a, b| {
                let da = degree.get(a.id.as_str()).copied().unwrap_or(0);
                let db = degree.get(b.id.as_str()).copied().unwrap_or(0);
                db.cmp(&da).then_with(|| a.display_name.cmp(&b.display_name))
            });
            members.truncate(self.summary_member_limit);
            let members: Vec<CommunityMember> = members
                .into_iter()
                .map(|e| CommunityMember {
                    name: e.display_name.clone(),
                    entity_type: e.entity_type,
                    description: e.description.clone(),
                })
                .collect();

            community.summary = match &self.summarizer {
                Some(summarizer) => match summarizer.summarize(&members).await {
                    Ok(summary) => summary,
                    Err(e) => {
                        warn!(community_id = %community.id, error = %e, "Summary generation failed; using member list");
                        fallback_summary(&members, community.member_entity_ids.len())
                    }
                },
                None => fallback_summary(&members, community.member_entity_ids.len()),
            };
        }
        communities
    }
}

fn fallback_summary(members: &[CommunityMember], size: usize) -> String {
    let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
    format!("{} entities: {}", size, names.join(", "))
}
