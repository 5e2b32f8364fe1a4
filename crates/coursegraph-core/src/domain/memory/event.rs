//! Learning events extracted from tutoring conversations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::domain::knowledge::normalize_name;

/// Kinds of learning signal a conversation can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LearningEventType {
    Mastered,
    Struggling,
    Reviewed,
    Connection,
}

impl LearningEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mastered => "MASTERED",
            Self::Struggling => "STRUGGLING",
            Self::Reviewed => "REVIEWED",
            Self::Connection => "CONNECTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "MASTERED" => Some(Self::Mastered),
            "STRUGGLING" => Some(Self::Struggling),
            "REVIEWED" => Some(Self::Reviewed),
            "CONNECTION" => Some(Self::Connection),
            _ => None,
        }
    }
}

impl fmt::Display for LearningEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fact about one student's relationship to one concept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningEvent {
    pub event_id: String,
    /// Anonymized, see [`anonymize_student_id`]
    pub student_id: String,
    pub concept_name: String,
    pub event_type: LearningEventType,
    pub confidence: f32,
    pub evidence: String,
    pub occurred_at: DateTime<Utc>,
}

impl LearningEvent {
    pub fn new(
        student_id: impl Into<String>,
        concept_name: impl Into<String>,
        event_type: LearningEventType,
        confidence: f32,
        evidence: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            student_id: student_id.into(),
            concept_name: concept_name.into(),
            event_type,
            confidence: confidence.clamp(0.0, 1.0),
            evidence: evidence.into(),
            occurred_at: Utc::now(),
        }
    }

    /// Deterministic key over the event's semantic content
    ///
    /// `event_id` and `occurred_at` are excluded so a re-extracted copy of
    /// the same fact maps to the same key.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.student_id.as_str(),
            normalize_name(&self.concept_name).as_str(),
            self.event_type.as_str(),
            self.evidence.trim(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Anonymize a raw student identifier as `student_<8 hex chars>`
pub fn anonymize_student_id(raw: &str) -> String {
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    format!("student_{}", &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_ignores_event_id_and_case() {
        let a = LearningEvent::new("student_1", "Raft", LearningEventType::Struggling, 0.8, "confused by terms");
        let b = LearningEvent::new("student_1", "  raft ", LearningEventType::Struggling, 0.6, "confused by terms");
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn test_idempotency_key_separates_fields() {
        let a = LearningEvent::new("s", "ab", LearningEventType::Mastered, 0.9, "c");
        let b = LearningEvent::new("s", "a", LearningEventType::Mastered, 0.9, "bc");
        assert_ne!(a.idempotency_key(), b.idempotency_key());
    }

    #[test]
    fn test_anonymize_student_id() {
        let id = anonymize_student_id("alice@example.edu");
        assert!(id.starts_with("student_"));
        assert_eq!(id.len(), "student_".len() + 8);
        assert_eq!(id, anonymize_student_id("alice@example.edu"));
        assert!(!id.contains("alice"));
    }

    #[test]
    fn test_confidence_clamped() {
        let e = LearningEvent::new("s", "Paxos", LearningEventType::Reviewed, 1.7, "");
        assert_eq!(e.confidence, 1.0);
    }
}
