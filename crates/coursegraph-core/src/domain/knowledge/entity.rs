//! Entity types for the course knowledge graph
//!
//! Candidates are chunk-scoped extraction outputs; canonical entities are the
//! resolved nodes persisted in the graph store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Fixed schema of entity types
///
/// `Concept` is the default type that absorbs ambiguous entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    /// Abstract idea (e.g., "strong consistency")
    #[default]
    Concept,
    /// Algorithm (e.g., "Raft", "two-phase commit")
    Algorithm,
    /// Protocol (e.g., "TCP", "gossip")
    Protocol,
    /// Theorem or impossibility result (e.g., "CAP theorem", "FLP")
    Theorem,
    /// Guarantee or property (e.g., "linearizability")
    Property,
    /// Failure model or anomaly (e.g., "split brain")
    FailureMode,
    /// Real system (e.g., "ZooKeeper", "Spanner")
    System,
    /// Data structure (e.g., "vector clock", "Merkle tree")
    DataStructure,
    /// Person (e.g., "Leslie Lamport")
    Person,
    /// Paper (e.g., "In Search of an Understandable Consensus Algorithm")
    Paper,
}

impl EntityType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concept => "CONCEPT",
            Self::Algorithm => "ALGORITHM",
            Self::Protocol => "PROTOCOL",
            Self::Theorem => "THEOREM",
            Self::Property => "PROPERTY",
            Self::FailureMode => "FAILURE_MODE",
            Self::System => "SYSTEM",
            Self::DataStructure => "DATA_STRUCTURE",
            Self::Person => "PERSON",
            Self::Paper => "PAPER",
        }
    }

    /// Parse from string, accepting any case and space/hyphen separators
    pub fn parse(s: &str) -> Option<Self> {
        let key = s.trim().to_uppercase().replace([' ', '-'], "_");
        Self::all().iter().copied().find(|t| t.as_str() == key)
    }

    /// Get all entity types
    pub fn all() -> &'static [EntityType] {
        &[
            Self::Concept,
            Self::Algorithm,
            Self::Protocol,
            Self::Theorem,
            Self::Property,
            Self::FailureMode,
            Self::System,
            Self::DataStructure,
            Self::Person,
            Self::Paper,
        ]
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a name for exact matching: lowercase, trimmed, single spaces
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Deterministic canonical id for a type and normalized name
pub fn canonical_id(entity_type: EntityType, normalized_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_name.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("ent_{}", &digest[..16])
}

/// An entity as produced by extraction, scoped to one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub name: String,
    pub entity_type: EntityType,
    pub description: String,
    pub source_chunk_id: String,
}

impl CandidateEntity {
    pub fn new(
        name: impl Into<String>,
        entity_type: EntityType,
        source_chunk_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type,
            description: String::new(),
            source_chunk_id: source_chunk_id.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Exact-tier merge key
    pub fn key(&self) -> (EntityType, String) {
        (self.entity_type, normalize_name(&self.name))
    }
}

/// The resolved, graph-persisted node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub id: String,
    pub entity_type: EntityType,
    pub display_name: String,
    pub description: String,
    /// Every surface form folded into this entity, including the display name
    pub aliases: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
    /// Lowest confidence of any merge that built this entity
    pub merge_confidence: f32,
    /// Chunks the entity was extracted from
    pub evidence_chunk_ids: BTreeSet<String>,
}

impl CanonicalEntity {
    /// Create an entity whose id is derived from its type and name
    pub fn new(display_name: impl Into<String>, entity_type: EntityType) -> Self {
        let display_name = display_name.into();
        let id = canonical_id(entity_type, &normalize_name(&display_name));
        let mut aliases = BTreeSet::new();
        aliases.insert(display_name.clone());

        Self {
            id,
            entity_type,
            display_name,
            description: String::new(),
            aliases,
            embedding: None,
            merge_confidence: 1.0,
            evidence_chunk_ids: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_evidence(mut self, chunk_id: impl Into<String>) -> Self {
        self.evidence_chunk_ids.insert(chunk_id.into());
        self
    }

    /// Check if this entity matches a name (including aliases)
    pub fn matches_name(&self, query: &str) -> bool {
        let query = normalize_name(query);
        self.aliases.iter().any(|alias| normalize_name(alias) == query)
    }

    /// Fold another entity's aliases and evidence into this one
    ///
    /// Merges are one-directional: `other` keeps nothing of its own identity.
    pub fn absorb(&mut self, other: &CanonicalEntity, confidence: f32) {
        self.aliases.extend(other.aliases.iter().cloned());
        self.evidence_chunk_ids
            .extend(other.evidence_chunk_ids.iter().cloned());
        if self.description.is_empty() && !other.description.is_empty() {
            self.description = other.description.clone();
        }
        self.merge_confidence = self.merge_confidence.min(confidence);
    }
}
