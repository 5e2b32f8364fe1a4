//! Error types for Coursegraph

use thiserror::Error;

/// Result type alias using Coursegraph's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Coursegraph error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Extraction errors (E100-E199)
    #[error("Extraction output violated the schema: {0}")]
    SchemaViolation(String),

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("LLM API error: {0}. Check your API key with `COURSEGRAPH_API_KEY`.")]
    LlmError(String),

    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Resolution errors (E200-E299)
    #[error("Entity resolution is ambiguous: {0}")]
    ResolutionAmbiguity(String),

    // Graph store errors (E300-E399)
    #[error("Graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Circuit breaker is open; graph writes are paused until the cool-down elapses")]
    CircuitOpen,

    // Fact log errors (E400-E499)
    #[error("WAL record '{record_id}' exhausted {attempts} attempts and was dead-lettered")]
    RecordExhausted { record_id: String, attempts: u32 },

    #[error("WAL record '{record_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        record_id: String,
        from: String,
        to: String,
    },

    #[error("WAL record '{0}' not found")]
    RecordNotFound(String),

    // Database errors (E500-E599)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Input errors (E700-E799)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaViolation(_) => "E100",
            Self::ExtractionFailed(_) => "E101",
            Self::EmbeddingFailed(_) => "E102",
            Self::LlmError(_) => "E103",
            Self::NetworkError(_) => "E104",
            Self::Timeout(_) => "E105",
            Self::Cancelled => "E106",
            Self::ResolutionAmbiguity(_) => "E200",
            Self::StoreUnavailable(_) => "E300",
            Self::CircuitOpen => "E301",
            Self::RecordExhausted { .. } => "E400",
            Self::InvalidTransition { .. } => "E401",
            Self::RecordNotFound(_) => "E402",
            Self::DatabaseError(_) => "E500",
            Self::Serialization(_) => "E501",
            Self::Io(_) => "E502",
            Self::ConfigError(_) => "E600",
            Self::InvalidInput(_) => "E700",
            Self::Other(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::StoreUnavailable(_) => Some(
                "Check the graph database path and re-run `incremental` indexing once it is reachable"
                    .to_string(),
            ),
            Self::CircuitOpen => Some("Pending facts are queued; no action needed".to_string()),
            Self::RecordExhausted { record_id, .. } => {
                Some(format!("Inspect dead-lettered record {} and replay it manually", record_id))
            }
            Self::LlmError(_) => Some("Set COURSEGRAPH_API_KEY or OPENAI_API_KEY".to_string()),
            Self::ConfigError(_) => Some("Review config.toml in the coursegraph config directory".to_string()),
            _ => None,
        }
    }

    /// Whether this error means the graph store itself failed
    ///
    /// Store failures abort batch runs and count against the sync
    /// worker's circuit breaker; everything else is local to one item.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::DatabaseError(_))
    }

    /// Whether the caller may retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SchemaViolation(_)
                | Self::NetworkError(_)
                | Self::Timeout(_)
                | Self::StoreUnavailable(_)
                | Self::DatabaseError(_)
        )
    }
}
