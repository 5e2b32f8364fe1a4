//! LLM integration - OpenAI-compatible API
//!
//! This module provides:
//! - HTTP client for chat completions and embeddings
//! - Request/response types matching the OpenAI API
//! - JSON extraction from model replies
//! - Model-backed adjudication and community summaries

mod client;
mod json;
mod roles;
mod types;

pub use client::{LlmClient, LlmClientBuilder};
pub use json::{extract_json_from_response, missing_required_fields};
pub use roles::{LlmAdjudicator, LlmSummarizer};
pub use types::{
    ChatRequest, ChatResponse, Choice, EmbeddingData, EmbeddingRequest, EmbeddingResponse, Message,
    MessageRole, ResponseFormat, Usage,
};
