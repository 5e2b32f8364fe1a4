//! Model-backed adjudication and community summaries
//!
//! Both wrap any [`StructuredCompletion`], so they run against
//! [`super::LlmClient`] in production and scripted clients in tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::knowledge::{
    AdjudicationOutcome, AdjudicationSubject, Adjudicator, CommunityMember, CommunitySummarizer,
    StructuredCompletion, Verdict,
};
use crate::error::{Error, Result};

/// Decides gray-band and cross-type entity pairs
pub struct LlmAdjudicator {
    client: Arc<dyn StructuredCompletion>,
}

impl LlmAdjudicator {
    pub fn new(client: Arc<dyn StructuredCompletion>) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct AdjudicationResponse {
    verdict: String,
    #[serde(default)]
    justification: String,
}

fn adjudication_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "verdict": {"type": "string", "enum": ["MERGE", "DISTINCT", "UNDECIDED"]},
            "justification": {"type": "string"}
        },
        "required": ["verdict", "justification"]
    })
}

fn describe(subject: &AdjudicationSubject) -> String {
    if subject.description.is_empty() {
        format!("{} ({})", subject.name, subject.entity_type)
    } else {
        format!("{} ({}): {}", subject.name, subject.entity_type, subject.description)
    }
}

#[async_trait]
impl Adjudicator for LlmAdjudicator {
    async fn adjudicate(
        &self,
        a: &AdjudicationSubject,
        b: &AdjudicationSubject,
    ) -> Result<AdjudicationOutcome> {
        let prompt = format!(
            r#"{system}

A: {a}
B: {b}

Answer MERGE only if A and B name the same thing in a distributed-systems course.
Answer DISTINCT if they differ, and UNDECIDED if the descriptions are not enough to tell."#,
            system = ADJUDICATION_SYSTEM_PROMPT,
            a = describe(a),
            b = describe(b),
        );

        let value = self.client.complete(&prompt, &adjudication_schema()).await?;
        let response: AdjudicationResponse = serde_json::from_value(value)
            .map_err(|e| Error::SchemaViolation(format!("Bad adjudication reply: {}", e)))?;

        let verdict = match response.verdict.trim().to_uppercase().as_str() {
            "MERGE" => Verdict::Merge,
            "DISTINCT" => Verdict::Distinct,
            _ => Verdict::Undecided,
        };
        debug!(a = %a.name, b = %b.name, verdict = ?verdict, "Adjudicated pair");
        Ok(AdjudicationOutcome {
            verdict,
            justification: response.justification,
        })
    }
}

/// Writes community summaries from member descriptions
pub struct LlmSummarizer {
    client: Arc<dyn StructuredCompletion>,
}

impl LlmSummarizer {
    pub fn new(client: Arc<dyn StructuredCompletion>) -> Self {
        Self { client }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

#[async_trait]
impl CommunitySummarizer for LlmSummarizer {
    async fn summarize(&self, members: &[CommunityMember]) -> Result<String> {
        let listing = members
            .iter()
            .map(|m| {
                if m.description.is_empty() {
                    format!("- {} ({})", m.name, m.entity_type)
                } else {
                    format!("- {} ({}): {}", m.name, m.entity_type, m.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{system}\n\nMEMBERS:\n{listing}",
            system = SUMMARY_SYSTEM_PROMPT,
        );
        let schema = json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"]
        });

        let value = self.client.complete(&prompt, &schema).await?;
        let response: SummaryResponse = serde_json::from_value(value)
            .map_err(|e| Error::SchemaViolation(format!("Bad summary reply: {}", e)))?;
        let summary = response.summary.trim();
        if summary.is_empty() {
            return Err(Error::SchemaViolation("Empty summary".to_string()));
        }
        Ok(summary.to_string())
    }
}

const ADJUDICATION_SYSTEM_PROMPT: &str = "You decide whether two extracted entities refer to the same concept. Prefer DISTINCT when unsure.";

const SUMMARY_SYSTEM_PROMPT: &str = r#"You summarize a cluster of related course concepts.

Write two or three sentences naming the shared theme and how the members relate.
Use only the descriptions given."#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::knowledge::EntityType;
    use std::sync::Mutex;

    struct Canned {
        reply: Value,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StructuredCompletion for Canned {
        async fn complete(&self, prompt: &str, _schema: &Value) -> Result<Value> {
            self.prompts.lock().expect("lock").push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    fn canned(reply: Value) -> Arc<Canned> {
        Arc::new(Canned {
            reply,
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn subject(name: &str, entity_type: EntityType) -> AdjudicationSubject {
        AdjudicationSubject {
            name: name.to_string(),
            entity_type,
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_adjudicator_parses_verdicts() {
        let client = canned(json!({"verdict": "merge", "justification": "same algorithm"}));
        let adjudicator = LlmAdjudicator::new(client.clone());
        let outcome = adjudicator
            .adjudicate(&subject("Multi-Paxos", EntityType::Protocol), &subject("multi paxos", EntityType::Algorithm))
            .await
            .expect("adjudicate");
        assert_eq!(outcome.verdict, Verdict::Merge);
        assert!(client.prompts.lock().expect("lock")[0].contains("Multi-Paxos (PROTOCOL)"));

        let adjudicator = LlmAdjudicator::new(canned(json!({"verdict": "maybe", "justification": ""})));
        let outcome = adjudicator
            .adjudicate(&subject("a", EntityType::Concept), &subject("b", EntityType::Concept))
            .await
            .expect("adjudicate");
        assert_eq!(outcome.verdict, Verdict::Undecided);
    }

    #[tokio::test]
    async fn test_adjudicator_rejects_malformed_reply() {
        let adjudicator = LlmAdjudicator::new(canned(json!({"answer": "yes"})));
        let result = adjudicator
            .adjudicate(&subject("a", EntityType::Concept), &subject("b", EntityType::Concept))
            .await;
        assert!(matches!(result, Err(Error::SchemaViolation(_))));
    }

    #[tokio::test]
    async fn test_summarizer_lists_members() {
        let client = canned(json!({"summary": "  Consensus protocols.  "}));
        let summarizer = LlmSummarizer::new(client.clone());
        let members = vec![CommunityMember {
            name: "Raft".to_string(),
            entity_type: EntityType::Algorithm,
            description: "Leader-based consensus".to_string(),
        }];
        assert_eq!(summarizer.summarize(&members).await.expect("summary"), "Consensus protocols.");
        assert!(client.prompts.lock().expect("lock")[0].contains("- Raft (ALGORITHM): Leader-based consensus"));

        let empty = LlmSummarizer::new(canned(json!({"summary": " "})));
        assert!(empty.summarize(&members).await.is_err());
    }
}
