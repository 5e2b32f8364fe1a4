//! Community hierarchy records

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A cluster of entities at one level of the hierarchy
///
/// Level 0 partitions all entities; each level `k + 1` community is a union
/// of level `k` communities, which point at it through `parent_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Community {
    pub id: String,
    pub level: u32,
    pub member_entity_ids: BTreeSet<String>,
    pub summary: String,
    pub parent_id: Option<String>,
}

impl Community {
    /// Stable id from level and ordinal within the level
    pub fn id_for(level: u32, ordinal: usize) -> String {
        format!("com_L{}_{}", level, ordinal)
    }
}
