//! OpenAI-compatible LLM client
//!
//! Provides:
//! - Schema-constrained chat completions ([`StructuredCompletion`])
//! - Batch embeddings ([`EmbeddingClient`])
//! - Rate limit handling with exponential backoff

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::domain::knowledge::{EmbeddingClient, StructuredCompletion};
use crate::error::{Error, Result};

use super::json::{extract_json_from_response, missing_required_fields};
use super::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message};

/// Maximum number of attempts for rate-limited requests
const MAX_RETRY_ATTEMPTS: u32 = 4;

/// Base delay for exponential backoff (in milliseconds)
const BACKOFF_BASE_MS: u64 = 1000;

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// HTTP client for chat completions and embeddings
#[derive(Clone)]
pub struct LlmClient {
    http_client: HttpClient,
    config: LlmConfig,
    api_key: String,
    embedding_model: String,
}

impl std::fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.config.base_url)
            .field("default_model", &self.config.default_model)
            .field("embedding_model", &self.embedding_model)
            .finish()
    }
}

/// Builder for creating an LlmClient
#[derive(Default)]
pub struct LlmClientBuilder {
    config: Option<LlmConfig>,
    api_key: Option<String>,
    base_url: Option<String>,
    embedding_model: Option<String>,
    timeout_secs: Option<u64>,
}

impl LlmClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: LlmConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Override the configured base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<LlmClient> {
        let mut config = self.config.unwrap_or_default();
        let api_key = self
            .api_key
            .ok_or_else(|| Error::LlmError("API key is required".to_string()))?;
        if let Some(base_url) = self.base_url {
            config.base_url = base_url;
        }
        config.base_url = config.base_url.trim_end_matches('/').to_string();

        let timeout_secs = self.timeout_secs.unwrap_or(config.timeout_secs);
        let http_client = HttpClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(Error::NetworkError)?;

        Ok(LlmClient {
            http_client,
            config,
            api_key,
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        })
    }
}

impl LlmClient {
    pub fn new(config: LlmConfig, api_key: impl Into<String>) -> Result<Self> {
        LlmClientBuilder::new().config(config).api_key(api_key).build()
    }

    /// Build from configuration, reading the key from the environment
    pub fn from_env(config: LlmConfig, embedding_model: impl Into<String>) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .map_err(|e| Error::ConfigError(e.to_string()))?
            .ok_or_else(|| Error::LlmError("No API key in the environment".to_string()))?;
        LlmClientBuilder::new()
            .config(config)
            .api_key(api_key)
            .embedding_model(embedding_model)
            .build()
    }

    pub fn builder() -> LlmClientBuilder {
        LlmClientBuilder::new()
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Send a chat request and return the first choice's content
    pub async fn chat(&self, messages: Vec<Message>, json_mode: bool) -> Result<String> {
        let mut request = ChatRequest::new(&self.config.default_model, messages)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        if json_mode {
            request = request.json_mode();
        }

        let response: ChatResponse = self.post_json("chat/completions", &request).await?;
        if let Some(usage) = &response.usage {
            debug!(
                model = %response.model,
                input_tokens = usage.prompt_tokens,
                output_tokens = usage.completion_tokens,
                "Chat completion finished"
            );
        }
        response
            .content()
            .map(str::to_string)
            .ok_or_else(|| Error::LlmError("Empty response from API".to_string()))
    }

    /// POST `body` to `{base_url}/{path}`, retrying on 429
    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let url = format!("{}/{}", self.config.base_url, path);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let response = self
                .http_client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await
                .map_err(Error::NetworkError)?;

            let status = response.status();
            if status.is_success() {
                return response
                    .json()
                    .await
                    .map_err(|e| Error::LlmError(format!("Failed to parse response: {}", e)));
            }

            let body_text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 && attempts < MAX_RETRY_ATTEMPTS {
                let backoff = calculate_backoff(attempts, extract_retry_after(&body_text).unwrap_or(0));
                warn!(attempt = attempts, wait_ms = backoff, "Rate limited, retrying after backoff");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                continue;
            }
            return Err(error_for_status(status, &body_text));
        }
    }
}

#[async_trait]
impl StructuredCompletion for LlmClient {
    async fn complete(&self, prompt: &str, schema: &Value) -> Result<Value> {
        let messages = vec![
            Message::system(format!(
                "Respond with a single JSON object matching this JSON schema:\n{}",
                schema
            )),
            Message::user(prompt),
        ];
        let content = self.chat(messages, true).await?;

        let json = extract_json_from_response(&content);
        let value: Value = serde_json::from_str(&json)
            .map_err(|e| Error::SchemaViolation(format!("Response is not JSON: {}", e)))?;
        let missing = missing_required_fields(schema, &value);
        if !missing.is_empty() {
            return Err(Error::SchemaViolation(format!("Missing fields: {}", missing.join(", "))));
        }
        Ok(value)
    }
}

#[async_trait]
impl EmbeddingClient for LlmClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts.to_vec(),
        };
        debug!(model = %request.model, inputs = texts.len(), "Sending embedding request");

        let response: EmbeddingResponse = self
            .post_json("embeddings", &request)
            .await
            .map_err(|e| match e {
                Error::LlmError(msg) => Error::EmbeddingFailed(msg),
                other => other,
            })?;
        let vectors = response.into_vectors();
        if vectors.len() != texts.len() {
            return Err(Error::EmbeddingFailed(format!(
                "Expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

fn error_for_status(status: reqwest::StatusCode, body: &str) -> Error {
    match status.as_u16() {
        401 => Error::LlmError("Unauthorized: invalid API key".to_string()),
        429 => Error::LlmError("Rate limited after retries".to_string()),
        400 => Error::LlmError(format!("Bad request: {}", body)),
        404 => Error::LlmError(format!("Model not found or endpoint unavailable: {}", body)),
        500..=599 => Error::LlmError(format!("Server error ({}): {}", status, body)),
        _ => Error::LlmError(format!("HTTP error {}: {}", status, body)),
    }
}

/// Backoff delay with up to 10% jitter
fn calculate_backoff(attempt: u32, suggested_wait_secs: u64) -> u64 {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << (attempt - 1).min(16));
    let delay = base.max(suggested_wait_secs.saturating_mul(1000));
    let jitter = (delay / 10).max(1);
    delay + rand::thread_rng().gen_range(0..jitter)
}

/// Extract retry-after seconds from an error body
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    json.get("retry_after")
        .or_else(|| json.get("error").and_then(|e| e.get("retry_after")))
        .and_then(Value::as_u64)
}
