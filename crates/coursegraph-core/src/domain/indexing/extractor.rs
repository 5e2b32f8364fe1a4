//! Schema-constrained extraction with gleaning
//!
//! One initial pass extracts entities and relationships from a chunk;
//! follow-up "gleaning" passes see the names already found and are asked
//! only for what was missed. Output outside the fixed type schema is
//! rejected, except that unknown entity types fall back to `CONCEPT`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::domain::knowledge::{
    CandidateEntity, CandidateRelationship, EntityType, RelationshipType, StructuredCompletion,
    normalize_name,
};
use crate::domain::memory::{LearningEvent, LearningEventType};
use crate::error::{Error, Result};

use super::chunk::Chunk;

/// Longest chunk text sent in one prompt, in characters
const MAX_PROMPT_CHARS: usize = 12_000;

/// Entities and relationships found in one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutput {
    pub entities: Vec<CandidateEntity>,
    pub relationships: Vec<CandidateRelationship>,
    /// Completion calls that returned usable output
    pub passes: u32,
    /// Items dropped for violating the type schema
    pub rejected: usize,
    /// Entities whose declared type was outside the schema, kept as `CONCEPT`
    pub coerced: usize,
}

impl ExtractionOutput {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }
}

/// Accumulates validated items across passes, deduplicating by key
struct Accumulator<'a> {
    chunk_id: &'a str,
    output: ExtractionOutput,
    entity_index: HashMap<(EntityType, String), usize>,
    relationship_keys: HashSet<(String, String, RelationshipType)>,
}

impl<'a> Accumulator<'a> {
    fn new(chunk_id: &'a str) -> Self {
        Self {
            chunk_id,
            output: ExtractionOutput::default(),
            entity_index: HashMap::new(),
            relationship_keys: HashSet::new(),
        }
    }

    /// Fold one pass in; returns how many new items it contributed
    fn absorb(&mut self, response: LlmExtractionResponse) -> usize {
        let mut added = 0;

        for raw in response.entities {
            let name = raw.name.trim();
            if name.is_empty() {
                self.output.rejected += 1;
                debug!(chunk_id = %self.chunk_id, "Rejected entity with empty name");
                continue;
            }
            let entity_type = match raw.entity_type.as_deref() {
                Some(declared) => EntityType::parse(declared).unwrap_or_else(|| {
                    self.output.coerced += 1;
                    warn!(
                        chunk_id = %self.chunk_id,
                        entity = name,
                        declared,
                        "Entity type outside the schema; recording as CONCEPT"
                    );
                    EntityType::Concept
                }),
                None => EntityType::Concept,
            };
            let description = raw.description.unwrap_or_default();
            if self.add_entity(name, entity_type, description.trim()) {
                added += 1;
            }
        }

        for raw in response.relationships {
            let source = raw.source.trim();
            let target = raw.target.trim();
            let Some(rel_type) = RelationshipType::parse(&raw.relationship_type) else {
                self.output.rejected += 1;
                debug!(
                    chunk_id = %self.chunk_id,
                    rel_type = %raw.relationship_type,
                    "Rejected relationship outside the schema"
                );
                continue;
            };
            if source.is_empty() || target.is_empty() || normalize_name(source) == normalize_name(target) {
                self.output.rejected += 1;
                debug!(chunk_id = %self.chunk_id, source, target, "Rejected relationship endpoints");
                continue;
            }

            let key = (normalize_name(source), normalize_name(target), rel_type);
            if !self.relationship_keys.insert(key) {
                continue;
            }
            // Endpoints nobody named as an entity become implicit concepts
            for endpoint in [source, target] {
                if !self.knows_name(endpoint) && self.add_entity(endpoint, EntityType::Concept, "") {
                    added += 1;
                }
            }
            self.output.relationships.push(CandidateRelationship {
                source_name: source.to_string(),
                target_name: target.to_string(),
                rel_type,
                description: raw.description.unwrap_or_default().trim().to_string(),
                source_chunk_id: self.chunk_id.to_string(),
            });
            added += 1;
        }

        added
    }

    fn knows_name(&self, name: &str) -> bool {
        let normalized = normalize_name(name);
        self.entity_index.keys().any(|(_, n)| *n == normalized)
    }

    fn add_entity(&mut self, name: &str, entity_type: EntityType, description: &str) -> bool {
        let key = (entity_type, normalize_name(name));
        if let Some(&index) = self.entity_index.get(&key) {
            let existing = &mut self.output.entities[index];
            if existing.description.is_empty() && !description.is_empty() {
                existing.description = description.to_string();
            }
            return false;
        }
        self.entity_index.insert(key, self.output.entities.len());
        self.output.entities.push(
            CandidateEntity::new(name, entity_type, self.chunk_id).with_description(description),
        );
        true
    }

    fn found_names(&self) -> Vec<String> {
        self.output
            .entities
            .iter()
            .map(|e| format!("- {} ({})", e.name, e.entity_type))
            .collect()
    }
}

/// Extraction engine over a structured-completion client
#[derive(Clone)]
pub struct Extractor {
    client: Arc<dyn StructuredCompletion>,
    max_gleaning_passes: u32,
}

impl Extractor {
    pub fn new(client: Arc<dyn StructuredCompletion>, config: &ExtractionConfig) -> Self {
        Self {
            client,
            max_gleaning_passes: config.max_gleaning_passes,
        }
    }

    pub fn with_gleaning_passes(mut self, passes: u32) -> Self {
        self.max_gleaning_passes = passes;
        self
    }

    /// Extract candidates from one chunk
    ///
    /// Fails only when the initial pass cannot produce schema-valid output
    /// after one stricter retry, or the client itself fails. A failing
    /// gleaning pass ends gleaning and keeps what was already found.
    pub async fn extract(&self, chunk: &Chunk) -> Result<ExtractionOutput> {
        let text = truncate_content(&chunk.text, MAX_PROMPT_CHARS);
        let schema = extraction_schema();
        let mut acc = Accumulator::new(&chunk.id);

        let initial: LlmExtractionResponse = self
            .complete_validated(&build_extraction_prompt(&text), &schema)
            .await?;
        acc.absorb(initial);
        acc.output.passes = 1;

        for pass in 1..=self.max_gleaning_passes {
            let prompt = build_gleaning_prompt(&text, &acc.found_names());
            let response: LlmExtractionResponse = match self.complete_validated(&prompt, &schema).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(chunk_id = %chunk.id, pass, error = %e, "Gleaning pass failed; keeping earlier results");
                    break;
                }
            };
            acc.output.passes += 1;
            let added = acc.absorb(response);
            debug!(chunk_id = %chunk.id, pass, added, "Gleaning pass complete");
            if added == 0 {
                break;
            }
        }

        let output = acc.output;
        if output.rejected > 0 {
            warn!(chunk_id = %chunk.id, rejected = output.rejected, "Dropped items outside the type schema");
        }
        info!(
            chunk_id = %chunk.id,
            entities = output.entities.len(),
            relationships = output.relationships.len(),
            passes = output.passes,
            coerced = output.coerced,
            "Chunk extracted"
        );
        Ok(output)
    }

    /// Extract learning events from a conversation transcript
    ///
    /// Events below `min_confidence` and events with an unknown type are
    /// dropped before anything is persisted.
    pub async fn extract_learning_events(
        &self,
        student_id: &str,
        transcript: &str,
        min_confidence: f32,
    ) -> Result<Vec<LearningEvent>> {
        let prompt = build_event_prompt(&truncate_content(transcript, MAX_PROMPT_CHARS));
        let response: LlmEventResponse = self.complete_validated(&prompt, &event_schema()).await?;

        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for raw in response.events {
            let Some(event_type) = LearningEventType::parse(&raw.event_type) else {
                debug!(event_type = %raw.event_type, "Dropped event with unknown type");
                continue;
            };
            if raw.concept.trim().is_empty() || raw.confidence < min_confidence {
                continue;
            }
            let event = LearningEvent::new(
                student_id,
                raw.concept.trim(),
                event_type,
                raw.confidence,
                raw.evidence.trim(),
            );
            if seen.insert(event.idempotency_key()) {
                events.push(event);
            }
        }

        debug!(student_id, events = events.len(), "Learning events extracted");
        Ok(events)
    }

    /// One completion validated against `T`, retried once with a stricter
    /// instruction on schema violation
    async fn complete_validated<T>(&self, prompt: &str, schema: &Value) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.complete_once(prompt, schema).await {
            Err(Error::SchemaViolation(reason)) => {
                warn!(reason = %reason, "Extraction output violated the schema; retrying strictly");
                let strict = format!("{}\n\n{}", prompt, STRICT_SUFFIX);
                self.complete_once(&strict, schema).await
            }
            other => other,
        }
    }

    async fn complete_once<T>(&self, prompt: &str, schema: &Value) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let value = self.client.complete(prompt, schema).await?;
        serde_json::from_value(value).map_err(|e| Error::SchemaViolation(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct LlmExtractionResponse {
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
    #[serde(default)]
    relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Deserialize)]
struct ExtractedEntity {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    entity_type: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractedRelationship {
    #[serde(default)]
    source: String,
    #[serde(default)]
    target: String,
    #[serde(rename = "type", default)]
    relationship_type: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmEventResponse {
    #[serde(default)]
    events: Vec<ExtractedEvent>,
}

#[derive(Debug, Deserialize)]
struct ExtractedEvent {
    concept: String,
    #[serde(rename = "type")]
    event_type: String,
    confidence: f32,
    #[serde(default)]
    evidence: String,
}

/// JSON schema for chunk extraction output
pub fn extraction_schema() -> Value {
    let entity_types: Vec<&str> = EntityType::all().iter().map(|t| t.as_str()).collect();
    let rel_types: Vec<&str> = RelationshipType::all().iter().map(|t| t.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "type": {"type": "string", "enum": entity_types},
                        "description": {"type": "string"}
                    },
                    "required": ["name", "type"]
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": {"type": "string"},
                        "target": {"type": "string"},
                        "type": {"type": "string", "enum": rel_types},
                        "description": {"type": "string"}
                    },
                    "required": ["source", "target", "type"]
                }
            }
        },
        "required": ["entities", "relationships"]
    })
}

/// JSON schema for conversation event extraction
pub fn event_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "events": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "concept": {"type": "string"},
                        "type": {"type": "string", "enum": ["MASTERED", "STRUGGLING", "REVIEWED", "CONNECTION"]},
                        "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        "evidence": {"type": "string"}
                    },
                    "required": ["concept", "type", "confidence"]
                }
            }
        },
        "required": ["events"]
    })
}

fn type_list() -> (String, String) {
    let entities = EntityType::all()
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let relationships = RelationshipType::all()
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    (entities, relationships)
}

fn build_extraction_prompt(text: &str) -> String {
    let (entity_types, rel_types) = type_list();
    format!(
        r#"{system}

Entity types: {entity_types}
Use CONCEPT when no other type clearly applies.

Relationship types: {rel_types}

TEXT:
"""
{text}
"""

Return JSON: {{"entities": [{{"name", "type", "description"}}], "relationships": [{{"source", "target", "type", "description"}}]}}"#,
        system = EXTRACTION_SYSTEM_PROMPT,
    )
}

fn build_gleaning_prompt(text: &str, found: &[String]) -> String {
    let (entity_types, rel_types) = type_list();
    format!(
        r#"{system}

Entity types: {entity_types}
Relationship types: {rel_types}

TEXT:
"""
{text}
"""

These entities were already extracted from the text:
{found}

Some entities and relationships were missed. Return ONLY items that are not
listed above, in the same JSON shape. Return empty arrays if nothing was missed."#,
        system = EXTRACTION_SYSTEM_PROMPT,
        found = found.join("\n"),
    )
}

fn build_event_prompt(transcript: &str) -> String {
    format!(
        r#"{system}

CONVERSATION:
"""
{transcript}
"""

Return JSON: {{"events": [{{"concept", "type", "confidence", "evidence"}}]}}"#,
        system = EVENT_SYSTEM_PROMPT,
    )
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You extract a knowledge graph from distributed-systems course material.

Guidelines:
1. Extract algorithms, protocols, theorems, properties, failure modes, systems, data structures, people and papers that the text actually discusses
2. Use the most specific entity type that applies
3. Use the canonical name (e.g., "Raft", not "the Raft algorithm")
4. Only relate entities that both appear in the text, using the listed relationship types
5. Keep descriptions to one sentence grounded in the text"#;

const EVENT_SYSTEM_PROMPT: &str = r#"You read a tutoring conversation and record what it shows about the student's learning.

Event types:
- MASTERED: the student explained or applied the concept correctly
- STRUGGLING: the student showed a misconception or repeated confusion
- REVIEWED: the concept was revisited without a clear outcome
- CONNECTION: the student linked the concept to another one

Give each event a confidence between 0 and 1 and quote the evidence briefly."#;

const STRICT_SUFFIX: &str = "Your previous answer was not valid. Respond with a single JSON object that matches the schema exactly: no prose, no markdown fences, no extra keys, and only the listed type values.";

/// Truncate to at most `max_chars` characters, on a char boundary
fn truncate_content(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}
