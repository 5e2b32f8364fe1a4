//! Relationship (edge) types for the course knowledge graph

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Fixed schema of relationship types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    /// Source must be understood before target
    PrerequisiteOf,
    /// Source implements target (e.g., Raft implements leader election)
    Implements,
    /// Source guarantees target property
    Guarantees,
    /// Source violates target property
    Violates,
    PartOf,
    VariantOf,
    AlternativeTo,
    ProposedIn,
    UsedBy,
    Teaches,
    IntroducedIn,
    /// Source addresses target failure mode
    Addresses,
    Requires,
}

impl RelationshipType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrerequisiteOf => "PREREQUISITE_OF",
            Self::Implements => "IMPLEMENTS",
            Self::Guarantees => "GUARANTEES",
            Self::Violates => "VIOLATES",
            Self::PartOf => "PART_OF",
            Self::VariantOf => "VARIANT_OF",
            Self::AlternativeTo => "ALTERNATIVE_TO",
            Self::ProposedIn => "PROPOSED_IN",
            Self::UsedBy => "USED_BY",
            Self::Teaches => "TEACHES",
            Self::IntroducedIn => "INTRODUCED_IN",
            Self::Addresses => "ADDRESSES",
            Self::Requires => "REQUIRES",
        }
    }

    /// Parse from string; anything outside the schema is `None`
    pub fn parse(s: &str) -> Option<Self> {
        let key = s.trim().to_uppercase().replace([' ', '-'], "_");
        Self::all().iter().copied().find(|t| t.as_str() == key)
    }

    /// Get all relationship types
    pub fn all() -> &'static [RelationshipType] {
        &[
            Self::PrerequisiteOf,
            Self::Implements,
            Self::Guarantees,
            Self::Violates,
            Self::PartOf,
            Self::VariantOf,
            Self::AlternativeTo,
            Self::ProposedIn,
            Self::UsedBy,
            Self::Teaches,
            Self::IntroducedIn,
            Self::Addresses,
            Self::Requires,
        ]
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic edge id for (source, target, type)
pub fn relationship_id(source_id: &str, target_id: &str, rel_type: RelationshipType) -> String {
    let mut hasher = Sha256::new();
    for part in [source_id, target_id, rel_type.as_str()] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("rel_{}", &digest[..16])
}

/// A relationship as produced by extraction; endpoints are names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRelationship {
    pub source_name: String,
    pub target_name: String,
    pub rel_type: RelationshipType,
    pub description: String,
    pub source_chunk_id: String,
}

/// A persisted edge between canonical entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub rel_type: RelationshipType,
    pub description: String,
    /// Chunks supporting this edge; duplicates are unioned
    pub evidence_chunk_ids: BTreeSet<String>,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        rel_type: RelationshipType,
    ) -> Self {
        let source_id = source_id.into();
        let target_id = target_id.into();
        Self {
            id: relationship_id(&source_id, &target_id, rel_type),
            source_id,
            target_id,
            rel_type,
            description: String::new(),
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_type_rejects_unknown() {
        assert_eq!(RelationshipType::parse("implements"), Some(RelationshipType::Implements));
        assert_eq!(RelationshipType::parse("prerequisite of"), Some(RelationshipType::PrerequisiteOf));
        assert_eq!(RelationshipType::parse("LIKES"), None);
        assert_eq!(RelationshipType::parse("IMPLEMENTS; DROP TABLE entities"), None);
    }

    #[test]
    fn test_relationship_id_is_deterministic_and_directional() {
        let forward = Relationship::new("a", "b", RelationshipType::Implements);
        let again = Relationship::new("a", "b", RelationshipType::Implements);
        let reverse = Relationship::new("b", "a", RelationshipType::Implements);
        assert_eq!(forward.id, again.id);
        assert_ne!(forward.id, reverse.id);
    }
}
