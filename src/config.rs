/// Configuration module for coderag.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./codebase.db".to_string()
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_fallback_extensions() -> Vec<String> {
    [
        "txt", "sql", "xml", "properties", "gradle", "kt", "scala", "c", "h", "cpp", "cs", "rb",
        "php", "sh", "html", "css",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

fn default_template_reference_keys() -> Vec<String> {
    ["$ref", "type", "class", "className", "javaType"]
        .iter()
        .map(|s| (*s).to_string())
        .collect()
}

fn default_max_chunk_tokens() -> usize {
    1500
}

fn default_window_lines() -> usize {
    40
}

fn default_window_overlap() -> usize {
    5
}

fn default_model_name() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_send_dimensions() -> bool {
    true
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_batch_size() -> usize {
    64
}

fn default_max_batch_tokens() -> usize {
    15_000
}

fn default_max_in_flight() -> usize {
    4
}

fn default_max_retries() -> u32 {
    4
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_search_top_k() -> usize {
    10
}

fn default_definition_top_k() -> usize {
    5
}

fn default_list_top_k() -> usize {
    50
}

fn default_min_similarity() -> f64 {
    0.3
}

fn default_list_min_similarity() -> f64 {
    0.1
}

fn default_context_budget_tokens() -> usize {
    12_000
}

fn default_expansion_seeds() -> usize {
    3
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_weight() -> f64 {
    1.0
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IndexerConfig {
    /// Files larger than this are skipped with a diagnostic.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Extensions chunked by line windows when no structural parser exists.
    #[serde(default = "default_fallback_extensions")]
    pub fallback_extensions: Vec<String>,

    /// Template keys whose string values name a class.
    #[serde(default = "default_template_reference_keys")]
    pub template_reference_keys: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,

    #[serde(default = "default_window_lines")]
    pub window_lines: usize,

    #[serde(default = "default_window_overlap")]
    pub window_overlap: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Deterministic offline embedder.
    #[default]
    Mock,
    /// OpenAI-compatible `/embeddings` endpoint.
    Http,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    #[serde(default = "default_model_name")]
    pub model: String,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Send `dimensions` with each HTTP request. Turn off for endpoints that
    /// reject the field; their model must then natively produce `dimensions`.
    #[serde(default = "default_send_dimensions")]
    pub send_dimensions: bool,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,

    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_top_k")]
    pub search_top_k: usize,

    #[serde(default = "default_definition_top_k")]
    pub definition_top_k: usize,

    #[serde(default = "default_list_top_k")]
    pub list_top_k: usize,

    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,

    #[serde(default = "default_list_min_similarity")]
    pub list_min_similarity: f64,

    #[serde(default = "default_context_budget_tokens")]
    pub context_budget_tokens: usize,

    /// How many top-ranked graph keys seed dependency expansion.
    #[serde(default = "default_expansion_seeds")]
    pub expansion_seeds: usize,

    #[serde(default)]
    pub fusion: FusionConfig,
}

/// Reciprocal rank fusion parameters for hybrid search.
#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
pub struct FusionConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,

    #[serde(default = "default_weight")]
    pub vector_weight: f64,

    #[serde(default = "default_weight")]
    pub lexical_weight: f64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            indexer: IndexerConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            fallback_extensions: default_fallback_extensions(),
            template_reference_keys: default_template_reference_keys(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_tokens: default_max_chunk_tokens(),
            window_lines: default_window_lines(),
            window_overlap: default_window_overlap(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_model_name(),
            dimensions: default_dimensions(),
            send_dimensions: default_send_dimensions(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            max_batch_tokens: default_max_batch_tokens(),
            max_in_flight: default_max_in_flight(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_top_k: default_search_top_k(),
            definition_top_k: default_definition_top_k(),
            list_top_k: default_list_top_k(),
            min_similarity: default_min_similarity(),
            list_min_similarity: default_list_min_similarity(),
            context_budget_tokens: default_context_budget_tokens(),
            expansion_seeds: default_expansion_seeds(),
            fusion: FusionConfig::default(),
        }
    }
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            vector_weight: default_weight(),
            lexical_weight: default_weight(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and optionally
    /// generates a template file.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            "config.json"
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            // Generate template only for the default path
            if path == "config.json" {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config = match serde_json::from_str(&data) {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid JSON in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.chunking.max_chunk_tokens > 0,
            "chunking.max_chunk_tokens must be positive"
        );
        anyhow::ensure!(
            self.chunking.window_lines > 0,
            "chunking.window_lines must be positive"
        );
        anyhow::ensure!(
            self.chunking.window_overlap < self.chunking.window_lines,
            "chunking.window_overlap must be smaller than window_lines"
        );
        anyhow::ensure!(
            self.embedding.dimensions > 0,
            "embedding.dimensions must be positive"
        );
        anyhow::ensure!(
            self.embedding.batch_size > 0,
            "embedding.batch_size must be positive"
        );
        anyhow::ensure!(
            self.embedding.max_in_flight > 0,
            "embedding.max_in_flight must be positive"
        );
        anyhow::ensure!(
            self.retrieval.search_top_k > 0,
            "retrieval.search_top_k must be positive"
        );
        anyhow::ensure!(
            self.retrieval.fusion.rrf_k >= 0.0,
            "retrieval.fusion.rrf_k must not be negative"
        );
        anyhow::ensure!(
            self.retrieval.fusion.vector_weight >= 0.0 && self.retrieval.fusion.lexical_weight >= 0.0,
            "retrieval.fusion weights must not be negative"
        );
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
