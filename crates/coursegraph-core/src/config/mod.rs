//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Coursegraph configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub indexing: IndexingConfig,
    pub extraction: ExtractionConfig,
    pub resolution: ResolutionConfig,
    pub community: CommunityConfig,
    pub wal: WalConfig,
    pub sync: SyncConfig,
    pub llm: LlmConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Upper bound on chunks extracted concurrently
    pub max_concurrency: usize,
    pub chunk_timeout_secs: u64,
    /// Staging mode keeps sources whose stable hash is divisible by this
    pub staging_sample_modulus: u64,
    pub chunk_size_tokens: usize,
    pub chunk_overlap_ratio: f32,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub max_gleaning_passes: u32,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub similarity_threshold: f32,
    /// Pairs between this floor and the threshold go to the adjudicator
    pub gray_band_floor: f32,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityConfig {
    pub resolution: f64,
    pub seed: u64,
    pub max_iterations: usize,
    pub min_modularity_gain: f64,
    pub max_levels: usize,
    pub summary_member_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub path: Option<PathBuf>,
    pub min_event_confidence: f32,
    pub flush_threshold_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub default_model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            chunk_timeout_secs: 120,
            staging_sample_modulus: 10,
            chunk_size_tokens: 512,
            chunk_overlap_ratio: 0.2,
            data_dir: None,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_gleaning_passes: 2,
            model: None,
        }
    }
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.90,
            gray_band_floor: 0.80,
            embedding_model: "text-embedding-3-small".to_string(),
        }
    }
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            seed: 42,
            max_iterations: 50,
            min_modularity_gain: 1e-6,
            max_levels: 5,
            summary_member_limit: 10,
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: None,
            min_event_confidence: 0.5,
            flush_threshold_tokens: 16_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            failure_threshold: 5,
            cooldown_secs: 60,
            poll_interval_ms: 1_000,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            default_model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "coursegraph_core=info".to_string(),
            json: false,
        }
    }
}

impl IndexingConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Overlap between adjacent chunks, in tokens
    pub fn overlap_tokens(&self) -> usize {
        (self.chunk_size_tokens as f32 * self.chunk_overlap_ratio).round() as usize
    }
}

impl SyncConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("COURSEGRAPH_API_KEY")
            .or_else(|_| env::var("OPENAI_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key()
            .map(|opt| opt.as_deref().map(redact_key))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("COURSEGRAPH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("coursegraph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Directory holding the graph database and the WAL
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.indexing.data_dir {
            return Ok(dir.clone());
        }
        Ok(dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join("coursegraph"))
    }

    /// Path of the graph database file
    pub fn graph_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.data_dir()?.join("graph.db"))
    }

    /// Path of the WAL database file
    pub fn wal_path(&self) -> anyhow::Result<PathBuf> {
        match &self.wal.path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.data_dir()?.join("wal.db")),
        }
    }

    /// Load configuration from file, or use defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;

        if self.indexing.max_concurrency == 0 {
            return Err(anyhow!("indexing.max_concurrency must be at least 1"));
        }
        if self.indexing.staging_sample_modulus == 0 {
            return Err(anyhow!("indexing.staging_sample_modulus must be at least 1"));
        }
        if self.indexing.chunk_size_tokens == 0 {
            return Err(anyhow!("indexing.chunk_size_tokens must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.indexing.chunk_overlap_ratio) {
            return Err(anyhow!("indexing.chunk_overlap_ratio must be in [0.0, 1.0)"));
        }

        let res = &self.resolution;
        if !(0.0..=1.0).contains(&res.similarity_threshold) {
            return Err(anyhow!("resolution.similarity_threshold must be between 0.0 and 1.0"));
        }
        if res.gray_band_floor > res.similarity_threshold {
            return Err(anyhow!(
                "resolution.gray_band_floor ({}) must not exceed similarity_threshold ({})",
                res.gray_band_floor,
                res.similarity_threshold
            ));
        }

        if self.community.resolution <= 0.0 {
            return Err(anyhow!("community.resolution must be positive"));
        }
        if self.community.max_levels == 0 {
            return Err(anyhow!("community.max_levels must be at least 1"));
        }

        if !(0.0..=1.0).contains(&self.wal.min_event_confidence) {
            return Err(anyhow!("wal.min_event_confidence must be between 0.0 and 1.0"));
        }

        if self.sync.batch_size == 0 {
            return Err(anyhow!("sync.batch_size must be at least 1"));
        }
        if self.sync.max_attempts == 0 {
            return Err(anyhow!("sync.max_attempts must be at least 1"));
        }
        if self.sync.failure_threshold == 0 {
            return Err(anyhow!("sync.failure_threshold must be at least 1"));
        }
        if self.sync.backoff_base_ms > self.sync.backoff_max_ms {
            return Err(anyhow!("sync.backoff_base_ms must not exceed sync.backoff_max_ms"));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(anyhow!("llm.temperature must be between 0.0 and 2.0"));
        }

        Ok(())
    }
}

/// `***` plus the last four characters; short keys show nothing
fn redact_key(key: &str) -> String {
    let chars = key.chars().count();
    if chars <= 4 {
        return "***".to_string();
    }
    let suffix: String = key.chars().skip(chars - 4).collect();
    format!("***{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resolution.similarity_threshold, 0.90);
        assert_eq!(config.extraction.max_gleaning_passes, 2);
        assert_eq!(config.sync.failure_threshold, 5);
        assert_eq!(config.indexing.overlap_tokens(), 102);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [resolution]
            similarity_threshold = 0.95

            [sync]
            batch_size = 10
            "#,
        )
        .expect("parse config");

        assert_eq!(config.resolution.similarity_threshold, 0.95);
        assert_eq!(config.resolution.gray_band_floor, 0.80);
        assert_eq!(config.sync.batch_size, 10);
        assert_eq!(config.sync.max_attempts, 5);
        assert_eq!(config.community.seed, 42);
    }

    #[test]
    fn test_validate_rejects_inverted_gray_band() {
        let mut config = Config::default();
        config.resolution.gray_band_floor = 0.95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.indexing.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_api_key_never_serialized() {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-secret".to_string());
        let toml = toml::to_string_pretty(&config).expect("serialize");
        assert!(!toml.contains("sk-secret"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redact_key_counts_characters() {
        assert_eq!(redact_key("sk-abcdef1234"), "***1234");
        assert_eq!(redact_key("abcd"), "***");
        assert_eq!(redact_key("clé-secrète"), "***rète");
        assert_eq!(redact_key("ключ🔑🔑"), "***юч🔑🔑");
        assert_eq!(redact_key("🔑🔑🔑"), "***");
    }

    #[test]
    fn test_wal_path_defaults_under_data_dir() {
        let mut config = Config::default();
        config.indexing.data_dir = Some(PathBuf::from("/tmp/cg"));
        assert_eq!(config.wal_path().expect("wal path"), PathBuf::from("/tmp/cg/wal.db"));
        assert_eq!(config.graph_path().expect("graph path"), PathBuf::from("/tmp/cg/graph.db"));
    }
}
