//! Conversation flush: learning events saved before compaction
//!
//! Runs on the request path, so it only touches the local fact log. The
//! sync worker carries the events into the graph later.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::WalConfig;
use crate::domain::indexing::Extractor;
use crate::error::Result;

use super::event::{LearningEvent, anonymize_student_id};
use super::wal::FactLog;
use super::worker::SyncWaker;

/// One turn of a tutoring conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Events persisted by one flush
#[derive(Debug, Clone, Default)]
pub struct FlushResult {
    pub events: Vec<LearningEvent>,
    /// WAL record id per event, in the same order
    pub record_ids: Vec<String>,
}

impl FlushResult {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Rough token count, four characters per token
pub fn estimate_tokens(messages: &[ConversationMessage]) -> usize {
    messages.iter().map(|m| m.content.chars().count().div_ceil(4)).sum()
}

pub struct ConversationFlush {
    extractor: Extractor,
    log: FactLog,
    waker: Option<SyncWaker>,
    threshold_tokens: usize,
    min_confidence: f32,
}

impl ConversationFlush {
    pub fn new(extractor: Extractor, log: FactLog, config: &WalConfig) -> Self {
        Self {
            extractor,
            log,
            waker: None,
            threshold_tokens: config.flush_threshold_tokens,
            min_confidence: config.min_event_confidence,
        }
    }

    /// Nudge this worker after every successful flush
    pub fn with_waker(mut self, waker: SyncWaker) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Whether the conversation is close enough to compaction to flush
    pub fn should_flush(&self, messages: &[ConversationMessage]) -> bool {
        estimate_tokens(messages) >= self.threshold_tokens
    }

    /// Extract events and append each durably to the fact log
    ///
    /// Extraction failures are logged and produce an empty result. A fact
    /// log failure is returned, since the events would otherwise be lost.
    pub async fn flush(&self, student_id: &str, messages: &[ConversationMessage]) -> Result<FlushResult> {
        if messages.is_empty() {
            return Ok(FlushResult::default());
        }

        let student = anonymize_student_id(student_id);
        let transcript = format_conversation(messages);

        let events = match self
            .extractor
            .extract_learning_events(&student, &transcript, self.min_confidence)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                warn!(student_id = %student, error = %e, "Conversation flush extraction failed; continuing without events");
                return Ok(FlushResult::default());
            }
        };

        let mut record_ids = Vec::with_capacity(events.len());
        for event in &events {
            record_ids.push(self.log.append(event).await?);
        }

        if !events.is_empty() {
            if let Some(waker) = &self.waker {
                waker.wake();
            }
        }

        info!(student_id = %student, events = events.len(), "Flushed learning events");
        Ok(FlushResult { events, record_ids })
    }
}

fn format_conversation(messages: &[ConversationMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("[{}]: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::domain::knowledge::StructuredCompletion;
    use crate::domain::memory::WalState;
    use crate::error::Error;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::Mutex;

    struct EventClient {
        response: Result<Value>,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StructuredCompletion for EventClient {
        async fn complete(&self, prompt: &str, _schema: &Value) -> Result<Value> {
            self.prompts.lock().expect("lock").push(prompt.to_string());
            match &self.response {
                Ok(v) => Ok(v.clone()),
                Err(_) => Err(Error::LlmError("model offline".to_string())),
            }
        }
    }

    fn flush_with(response: Result<Value>, log: FactLog) -> (ConversationFlush, Arc<EventClient>) {
        let client = Arc::new(EventClient {
            response,
            prompts: Mutex::new(Vec::new()),
        });
        let extractor = Extractor::new(client.clone(), &ExtractionConfig::default());
        (ConversationFlush::new(extractor, log, &WalConfig::default()), client)
    }

    fn conversation() -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::new("student", "Why does Raft need terms?"),
            ConversationMessage::new("tutor", "Terms act as a logical clock."),
        ]
    }

    #[test]
    fn test_estimate_tokens() {
        let messages = vec![ConversationMessage::new("student", "abcdefgh"), ConversationMessage::new("tutor", "abc")];
        assert_eq!(estimate_tokens(&messages), 3);
    }

    #[tokio::test]
    async fn test_should_flush_against_threshold() {
        let log = FactLog::in_memory().await.expect("log");
        let (flush, _) = flush_with(Ok(json!({"events": []})), log);
        assert!(!flush.should_flush(&conversation()));
        let long = vec![ConversationMessage::new("student", "x".repeat(4 * 16_000))];
        assert!(flush.should_flush(&long));
    }

    #[tokio::test]
    async fn test_flush_appends_anonymized_events() {
        let log = FactLog::in_memory().await.expect("log");
        let response = json!({"events": [
            {"concept": "Raft terms", "type": "STRUGGLING", "confidence": 0.8, "evidence": "asked why terms exist"},
            {"concept": "logical clocks", "type": "REVIEWED", "confidence": 0.3, "evidence": "mentioned"}
        ]});
        let (flush, client) = flush_with(Ok(response), log.clone());

        let result = flush.flush("alice@example.edu", &conversation()).await.expect("flush");
        assert_eq!(result.events.len(), 1);
        assert!(result.events[0].student_id.starts_with("student_"));

        let pending = log.scan(WalState::Pending).await.expect("scan");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, result.record_ids[0]);

        let prompts = client.prompts.lock().expect("lock");
        assert!(prompts[0].contains("[student]: Why does Raft need terms?"));
        assert!(!prompts[0].contains("alice"));
    }

    #[tokio::test]
    async fn test_extraction_failure_yields_nothing() {
        let log = FactLog::in_memory().await.expect("log");
        let (flush, _) = flush_with(Err(Error::LlmError(String::new())), log.clone());

        let result = flush.flush("bob", &conversation()).await.expect("flush never fails on extraction");
        assert!(result.is_empty());
        assert!(log.scan(WalState::Pending).await.expect("scan").is_empty());
    }
}
