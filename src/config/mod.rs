// src/config/mod.rs
// Typed configuration loaded from a single YAML document.
// Each component receives only its own sub-tree at construction time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{MnemoError, Result};
use crate::validator::Rule;

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub vector_store: VectorStoreConfig,
    pub state_manager: StateManagerConfig,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub generator: Option<GeneratorConfig>,
    #[serde(default)]
    pub ingestors: IngestorsConfig,
    #[serde(default)]
    pub prompt_builder: PromptBuilderConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            MnemoError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| MnemoError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.vector_store.embedding_dim == 0 {
            return Err(MnemoError::Config(
                "vector_store.embedding_dim must be positive".into(),
            ));
        }
        if self.embedder.dimensions != self.vector_store.embedding_dim {
            return Err(MnemoError::Config(format!(
                "embedder.dimensions ({}) does not match vector_store.embedding_dim ({})",
                self.embedder.dimensions, self.vector_store.embedding_dim
            )));
        }
        if self.pipelines.default.batch_size == 0 {
            return Err(MnemoError::Config(
                "pipelines.default.batch_size must be positive".into(),
            ));
        }
        if self.vector_store.enable_bm25
            && regex::Regex::new(&self.vector_store.tokenizer_pattern).is_err()
        {
            return Err(MnemoError::Config(format!(
                "vector_store.tokenizer_pattern is not a valid regex: {}",
                self.vector_store.tokenizer_pattern
            )));
        }
        Ok(())
    }
}

/// Vector store configuration: dense collections + BM25 sidecar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub persist_directory: PathBuf,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
    pub embedding_dim: usize,
    #[serde(default = "default_true")]
    pub enable_bm25: bool,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    #[serde(default = "default_tokenizer_pattern")]
    pub tokenizer_pattern: String,
    /// Routes each source to its own collection; unmapped sources fall back
    /// to `collection_name`.
    #[serde(default = "default_source_collections")]
    pub source_collections: BTreeMap<String, String>,
}

fn default_collection_name() -> String {
    "documents".to_string()
}

fn default_true() -> bool {
    true
}

fn default_bm25_k1() -> f64 {
    1.5
}

fn default_bm25_b() -> f64 {
    0.75
}

fn default_tokenizer_pattern() -> String {
    r"\b\w+\b".to_string()
}

fn default_source_collections() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("telegram".to_string(), "telegram_messages".to_string()),
        ("whatsapp".to_string(), "whatsapp_messages".to_string()),
        ("github".to_string(), "github_data".to_string()),
    ])
}

/// Ingestor state database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateManagerConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelinesConfig {
    #[serde(default)]
    pub default: PipelineConfig,
    #[serde(default)]
    pub file: FilePipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            schedule: ScheduleConfig::default(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    5
}

/// File-driven ingestion: one directory of JSON batch files, processed in ticks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePipelineConfig {
    #[serde(default = "default_watch_directory")]
    pub watch_directory: PathBuf,
    #[serde(default = "default_files_per_tick")]
    pub files_per_tick: usize,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
}

impl Default for FilePipelineConfig {
    fn default() -> Self {
        Self {
            watch_directory: default_watch_directory(),
            files_per_tick: default_files_per_tick(),
            interval_minutes: default_interval_minutes(),
        }
    }
}

fn default_watch_directory() -> PathBuf {
    PathBuf::from("./data/inbox")
}

fn default_files_per_tick() -> usize {
    10
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    pub model_name: String,
    pub dimensions: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl EmbedderConfig {
    /// API key from config, falling back to OPENAI_API_KEY.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

fn default_embed_provider() -> String {
    "openai".to_string()
}

/// Language model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default = "default_embed_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_generator_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub default_options: GenerationOptions,
}

impl GeneratorConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

fn default_generator_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Per-call generation defaults, overridable at each call site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
        }
    }
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_top_p() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestorsConfig {
    #[serde(default)]
    pub telegram: Option<TelegramIngestorConfig>,
    #[serde(default)]
    pub whatsapp: Option<WhatsappIngestorConfig>,
    #[serde(default)]
    pub github: Option<GithubIngestorConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramIngestorConfig {
    pub base_url: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsappIngestorConfig {
    pub base_url: String,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubIngestorConfig {
    #[serde(default = "default_github_api")]
    pub api_base: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
}

fn default_rate_limit() -> u32 {
    60
}

fn default_auth_timeout() -> u64 {
    300
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

/// Prompt builder templates; empty fields use the built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptBuilderConfig {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub fallback_template: Option<String>,
    #[serde(default)]
    pub error_template: Option<String>,
    #[serde(default)]
    pub user_reference: UserReferenceConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserReferenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub terms: Vec<String>,
    #[serde(default)]
    pub template: Option<String>,
}

/// Query orchestration settings: retrieval depth, thresholds, validation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_num_results")]
    pub num_results: usize,
    /// Sources the always-active built-in rule accepts.
    #[serde(default = "default_allowed_sources")]
    pub allowed_sources: Vec<String>,
    #[serde(default)]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub enable_query_expansion: bool,
    #[serde(default = "default_collect_all_failures")]
    pub collect_all_failures: bool,
    #[serde(default = "default_generation_failed_message")]
    pub generation_failed_message: String,
    #[serde(default = "default_not_allowed_message")]
    pub not_allowed_message: String,
    /// Rule lists keyed by user id; "default" applies when the user has none.
    #[serde(default)]
    pub validation_rules: BTreeMap<String, Vec<Rule>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_results: default_num_results(),
            allowed_sources: default_allowed_sources(),
            similarity_threshold: 0.0,
            enable_query_expansion: false,
            collect_all_failures: default_collect_all_failures(),
            generation_failed_message: default_generation_failed_message(),
            not_allowed_message: default_not_allowed_message(),
            validation_rules: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Resolve the rule list for a user, falling back to "default".
    /// No configured rules at all yields an empty list (only the built-in
    /// source check applies).
    pub fn rules_for(&self, user_id: &str) -> Vec<Rule> {
        if let Some(rules) = self.validation_rules.get(user_id) {
            return rules.clone();
        }
        match self.validation_rules.get("default") {
            Some(rules) => rules.clone(),
            None => {
                warn!("no validation rules configured for user '{}' and no default list", user_id);
                Vec::new()
            }
        }
    }
}

fn default_num_results() -> usize {
    5
}

fn default_allowed_sources() -> Vec<String> {
    vec!["cli".to_string()]
}

fn default_collect_all_failures() -> bool {
    true
}

fn default_generation_failed_message() -> String {
    "I could not generate a response right now. Please try again later.".to_string()
}

fn default_not_allowed_message() -> String {
    "This request is not allowed.".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
vector_store:
  persist_directory: ./data/vectors
  embedding_dim: 8
state_manager:
  db_path: ./data/state.db
embedder:
  model_name: text-embedding-3-small
  dimensions: 8
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.vector_store.collection_name, "documents");
        assert!(config.vector_store.enable_bm25);
        assert_eq!(config.vector_store.bm25_k1, 1.5);
        assert_eq!(config.vector_store.bm25_b, 0.75);
        assert_eq!(config.vector_store.tokenizer_pattern, r"\b\w+\b");
        assert_eq!(config.pipelines.default.batch_size, 100);
        assert_eq!(config.pipelines.default.schedule.interval_minutes, 5);
        assert_eq!(config.orchestrator.num_results, 5);
        assert!(!config.orchestrator.enable_query_expansion);
        assert_eq!(
            config.vector_store.source_collections.get("telegram").unwrap(),
            "telegram_messages"
        );
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let raw = MINIMAL.replace("dimensions: 8", "dimensions: 16");
        let config: Config = serde_yaml::from_str(&raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_tokenizer_pattern_rejected() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.vector_store.tokenizer_pattern = "[unclosed".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rules_for_user_fallback() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        config.orchestrator.validation_rules.insert(
            "default".to_string(),
            vec![Rule::Length { min: 1, max: 100 }],
        );
        config.orchestrator.validation_rules.insert(
            "alice".to_string(),
            vec![Rule::Keyword { forbidden: vec!["secret".into()] }],
        );

        assert_eq!(config.orchestrator.rules_for("alice").len(), 1);
        assert!(matches!(
            config.orchestrator.rules_for("bob")[0],
            Rule::Length { .. }
        ));
    }

    #[test]
    fn test_generation_defaults() {
        let options = GenerationOptions::default();
        assert_eq!(options.temperature, 0.7);
        assert_eq!(options.max_tokens, 1024);
        assert_eq!(options.top_p, 1.0);
    }
}
