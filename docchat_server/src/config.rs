use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use docchat_core::models::ModelFamily;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub vector_store: VectorStoreConfig,
  #[serde(default)]
  pub embedding: EmbeddingConfig,
  #[serde(default)]
  pub llm: LlmConfig,
  #[serde(default)]
  pub reranker: RerankerConfig,
  #[serde(default)]
  pub hybrid: HybridConfig,
  #[serde(default)]
  pub rag: RagConfig,
  #[serde(default)]
  pub prompts: PromptsConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub stats: StatsConfig,
  #[serde(default)]
  pub retention: RetentionConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
  pub host: String,
  pub port: u16,
  pub db_url: String,
  /// Base directory for the logs/ tree.
  pub base_dir: PathBuf,
  pub timezone: String,
  pub debug: bool,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host: "0.0.0.0".to_string(),
      port: 8010,
      db_url: "sqlite://docchat.db".to_string(),
      base_dir: PathBuf::from("."),
      timezone: "Asia/Seoul".to_string(),
      debug: false,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VectorStoreConfig {
  pub url: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub api_key: Option<String>,
  pub timeout_seconds: u64,
  pub temp_collection_ttl_minutes: i64,
}

impl Default for VectorStoreConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:6333".to_string(),
      api_key: None,
      timeout_seconds: 30,
      temp_collection_ttl_minutes: 60,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmbeddingConfig {
  pub url: String,
  pub model: String,
  pub dimension: usize,
  pub timeout_seconds: u64,
}

impl Default for EmbeddingConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8083".to_string(),
      model: "bge-m3-korean".to_string(),
      dimension: 1024,
      timeout_seconds: 60,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelOverride {
  pub base_url: String,
  pub model: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub temperature: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub top_p: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
  pub base_url: String,
  pub model: String,
  pub temperature: f32,
  pub top_p: f32,
  pub max_tokens: u32,
  pub timeout_seconds: u64,
  pub stream_timeout_seconds: u64,
  /// Per-model-key endpoint overrides, keyed by the key clients send.
  #[serde(default)]
  pub models: HashMap<String, ModelOverride>,
}

impl Default for LlmConfig {
  fn default() -> Self {
    let mut models = HashMap::new();
    models.insert(
      "gpt-oss-20b".to_string(),
      ModelOverride {
        base_url: "http://localhost:8080".to_string(),
        model: "gpt-oss-20b".to_string(),
        temperature: None,
        top_p: None,
        max_tokens: None,
      },
    );
    models.insert(
      "exaone-deep-7.8b".to_string(),
      ModelOverride {
        base_url: "http://localhost:8085".to_string(),
        model: "exaone-deep-7.8b".to_string(),
        temperature: Some(0.6),
        top_p: Some(0.95),
        max_tokens: Some(8192),
      },
    );
    models.insert(
      "exaone-4.0-32b".to_string(),
      ModelOverride {
        base_url: "http://localhost:8081".to_string(),
        model: "exaone-4.0-32b".to_string(),
        temperature: Some(0.7),
        top_p: Some(0.9),
        max_tokens: Some(8192),
      },
    );
    Self {
      base_url: "http://localhost:8080".to_string(),
      model: "gpt-oss-20b".to_string(),
      temperature: 0.7,
      top_p: 0.9,
      max_tokens: 4096,
      timeout_seconds: 180,
      stream_timeout_seconds: 300,
      models,
    }
  }
}

impl LlmConfig {
  pub fn default_endpoint(&self) -> ai_sdk::ModelEndpoint {
    ai_sdk::ModelEndpoint {
      base_url: self.base_url.clone(),
      model: self.model.clone(),
      temperature: self.temperature,
      top_p: self.top_p,
      max_tokens: self.max_tokens,
      deep_reasoning: ModelFamily::of_key(&self.model).strips_thought(),
    }
  }

  pub fn endpoint_overrides(&self) -> HashMap<String, ai_sdk::ModelEndpoint> {
    self
      .models
      .iter()
      .map(|(key, m)| {
        (
          key.clone(),
          ai_sdk::ModelEndpoint {
            base_url: m.base_url.clone(),
            model: m.model.clone(),
            temperature: m.temperature.unwrap_or(self.temperature),
            top_p: m.top_p.unwrap_or(self.top_p),
            max_tokens: m.max_tokens.unwrap_or(self.max_tokens),
            deep_reasoning: ModelFamily::of_key(key).strips_thought(),
          },
        )
      })
      .collect()
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RerankerConfig {
  pub url: String,
  pub model: String,
  pub timeout_seconds: u64,
  pub enabled: bool,
  pub top_k_multiplier: usize,
  pub score_threshold: f32,
  pub minimum_answer_threshold: f32,
}

impl Default for RerankerConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:8006".to_string(),
      model: "BAAI/bge-reranker-v2-m3".to_string(),
      timeout_seconds: 60,
      enabled: true,
      top_k_multiplier: 3,
      score_threshold: 0.2,
      minimum_answer_threshold: 0.3,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HybridConfig {
  pub enabled: bool,
  /// Informational only: fusion is pure RRF and does not consume the
  /// weights. The surface is preserved for future weighting.
  pub vector_weight: f32,
  pub bm25_weight: f32,
  pub rrf_k: usize,
}

impl Default for HybridConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      vector_weight: 0.7,
      bm25_weight: 0.3,
      rrf_k: 60,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RagConfig {
  pub default_top_k: usize,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub default_score_threshold: Option<f32>,
  pub default_reasoning_level: String,
  pub citation_extraction: bool,
}

impl Default for RagConfig {
  fn default() -> Self {
    Self {
      default_top_k: 5,
      default_score_threshold: Some(0.4),
      default_reasoning_level: "medium".to_string(),
      citation_extraction: true,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PromptsConfig {
  pub dir: PathBuf,
}

impl Default for PromptsConfig {
  fn default() -> Self {
    Self {
      dir: PathBuf::from("prompts"),
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
  pub queue_size: usize,
  pub session_queue_size: usize,
  pub batch_size: usize,
  pub session_batch_size: usize,
  pub flush_interval_seconds: u64,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      queue_size: 1000,
      session_queue_size: 500,
      batch_size: 20,
      session_batch_size: 50,
      flush_interval_seconds: 5,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StatsConfig {
  /// Lines per processing chunk; 0 loads the whole shard at once.
  pub chunk_size: usize,
  pub large_file_threshold: usize,
}

impl Default for StatsConfig {
  fn default() -> Self {
    Self {
      chunk_size: 10_000,
      large_file_threshold: 100_000,
    }
  }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetentionConfig {
  pub retention_days: i64,
  pub compress_after_days: i64,
  pub conversation_sample_rate: f64,
}

impl Default for RetentionConfig {
  fn default() -> Self {
    Self {
      retention_days: 30,
      compress_after_days: 7,
      conversation_sample_rate: 1.0,
    }
  }
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      server: ServerConfig::default(),
      vector_store: VectorStoreConfig::default(),
      embedding: EmbeddingConfig::default(),
      llm: LlmConfig::default(),
      reranker: RerankerConfig::default(),
      hybrid: HybridConfig::default(),
      rag: RagConfig::default(),
      prompts: PromptsConfig::default(),
      logging: LoggingConfig::default(),
      stats: StatsConfig::default(),
      retention: RetentionConfig::default(),
    }
  }
}

impl AppConfig {
  pub fn load() -> Result<Self> {
    let candidates = [
      env::var("DOCCHAT_CONFIG").ok(),
      Some("/app/config/docchat.yml".to_string()),
      Some("/etc/docchat/docchat.yml".to_string()),
      Some("docchat.yml".to_string()),
      Some("docchat.yaml".to_string()),
    ];

    let mut config = None;
    for candidate in candidates.into_iter().flatten() {
      match std::fs::File::open(&candidate) {
        Ok(file) => match serde_yaml::from_reader(file) {
          Ok(parsed) => {
            tracing::info!("configuration loaded from {candidate}");
            config = Some(parsed);
            break;
          }
          Err(e) => {
            tracing::warn!("parse error in {candidate}: {e}");
          }
        },
        Err(_) => continue,
      }
    }

    let mut config: AppConfig = config.unwrap_or_default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
  }

  /// Environment variables beat the config file.
  fn apply_env_overrides(&mut self) {
    if let Ok(url) = env::var("QDRANT_URL") {
      if !url.is_empty() {
        self.vector_store.url = url;
      }
    }
    if let Ok(url) = env::var("EMBEDDING_URL") {
      if !url.is_empty() {
        self.embedding.url = url;
      }
    }
    if let Ok(url) = env::var("LLM_BASE_URL") {
      if !url.is_empty() {
        self.llm.base_url = url;
      }
    }
    if let Ok(url) = env::var("RERANKER_URL") {
      if !url.is_empty() {
        self.reranker.url = url;
      }
    }
    if let Ok(url) = env::var("DATABASE_URL") {
      if !url.is_empty() {
        self.server.db_url = url;
      }
    }
    if let Ok(v) = env::var("USE_RERANKING") {
      self.reranker.enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = env::var("USE_HYBRID_SEARCH") {
      self.hybrid.enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.server.db_url.is_empty() {
      bail!("db_url cannot be empty");
    }
    if !self.server.db_url.starts_with("sqlite:") {
      bail!("db_url must start with 'sqlite:'");
    }
    if self.embedding.dimension == 0 {
      bail!("embedding dimension must be greater than 0");
    }
    if self.llm.model.is_empty() {
      bail!("default LLM model cannot be empty");
    }
    if self.reranker.top_k_multiplier == 0 {
      bail!("rerank top_k multiplier must be greater than 0");
    }
    if self.hybrid.rrf_k == 0 {
      bail!("rrf_k must be greater than 0");
    }
    if !(0.0..=1.0).contains(&self.retention.conversation_sample_rate) {
      bail!("conversation_sample_rate must be within [0, 1]");
    }
    Ok(())
  }

  /// One-line summary for startup logging; no secrets.
  pub fn summary(&self) -> String {
    format!(
      "docchat config: vector={}, embed={} (dim {}), llm={} ({} overrides), rerank={}, hybrid={} (w_vec={}, w_bm25={}, rrf_k={})",
      self.vector_store.url,
      self.embedding.url,
      self.embedding.dimension,
      self.llm.model,
      self.llm.models.len(),
      if self.reranker.enabled { "on" } else { "off" },
      if self.hybrid.enabled { "on" } else { "off" },
      self.hybrid.vector_weight,
      self.hybrid.bm25_weight,
      self.hybrid.rrf_k,
    )
  }

  pub fn logs_data_dir(&self) -> PathBuf {
    self.server.base_dir.join("logs").join("data")
  }

  pub fn logs_overflow_dir(&self) -> PathBuf {
    self.server.base_dir.join("logs").join("overflow")
  }

  pub fn logs_conversation_dir(&self) -> PathBuf {
    self.server.base_dir.join("logs").join("conversations")
  }
}
