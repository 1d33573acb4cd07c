//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! [`load_config`] validates the file before anything touches the network,
//! so a missing model name or an impossible tiling setup fails at startup
//! rather than halfway through a sync.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use clinical_rag_core::chunk::{
    ChunkingParams, DEFAULT_TILE_OVERLAP, DEFAULT_TILE_SIZE, JSON_CHAR_CAP,
};

/// Environment variable holding the API key for OpenAI-compatible providers.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_tile_size")]
    pub tile_size: usize,
    #[serde(default = "default_tile_overlap")]
    pub tile_overlap: usize,
    #[serde(default = "default_json_char_cap")]
    pub json_char_cap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            json_char_cap: JSON_CHAR_CAP,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkingParams {
        ChunkingParams {
            tile_size: self.tile_size,
            tile_overlap: self.tile_overlap,
            json_char_cap: self.json_char_cap,
        }
    }
}

fn default_tile_size() -> usize {
    DEFAULT_TILE_SIZE
}
fn default_tile_overlap() -> usize {
    DEFAULT_TILE_OVERLAP
}
fn default_json_char_cap() -> usize {
    JSON_CHAR_CAP
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_k")]
    pub search_k: usize,
    #[serde(default = "default_followup_k")]
    pub followup_k: usize,
    #[serde(default = "default_max_search_iterations")]
    pub max_search_iterations: usize,
    #[serde(default = "default_chunk_budget")]
    pub chunk_budget: usize,
    #[serde(default = "default_true")]
    pub include_related: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_k: default_search_k(),
            followup_k: default_followup_k(),
            max_search_iterations: default_max_search_iterations(),
            chunk_budget: default_chunk_budget(),
            include_related: true,
        }
    }
}

fn default_search_k() -> usize {
    10
}
fn default_followup_k() -> usize {
    5
}
fn default_max_search_iterations() -> usize {
    3
}
fn default_chunk_budget() -> usize {
    40
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum score (0-10) a snippet should reach to be kept.
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    #[serde(default = "default_target")]
    pub target: usize,
    #[serde(default = "default_rerank_batch_size")]
    pub batch_size: usize,
    /// Batches run concurrently only when there are at most this many.
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,
    /// How many pre-rerank snippets to keep when nothing survives reranking.
    #[serde(default = "default_fallback_prefix")]
    pub fallback_prefix: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            target: default_target(),
            batch_size: default_rerank_batch_size(),
            max_concurrent_batches: default_max_concurrent_batches(),
            fallback_prefix: default_fallback_prefix(),
        }
    }
}

fn default_threshold() -> u8 {
    5
}
fn default_target() -> usize {
    25
}
fn default_rerank_batch_size() -> usize {
    10
}
fn default_max_concurrent_batches() -> usize {
    3
}
fn default_fallback_prefix() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            base_url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Chat model settings, passed explicitly to every stage that calls a model.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_provider")]
    pub provider: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Skip the reranking pass for this model even when `[rerank]` is enabled.
    #[serde(default)]
    pub disable_reranking: bool,
    #[serde(default = "default_model_retries")]
    pub max_retries: u32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_model_provider(),
            name: None,
            base_url: default_base_url(),
            temperature: default_temperature(),
            disable_reranking: false,
            max_retries: default_model_retries(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn model_name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}

fn default_model_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_model_retries() -> u32 {
    3
}
fn default_model_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.tile_size == 0 {
        bail!("chunking.tile_size must be > 0");
    }
    if config.chunking.tile_overlap >= config.chunking.tile_size {
        bail!("chunking.tile_overlap must be < chunking.tile_size");
    }
    if config.chunking.json_char_cap == 0 {
        bail!("chunking.json_char_cap must be > 0");
    }

    if config.sync.page_size == 0 {
        bail!("sync.page_size must be > 0");
    }

    // Validate retrieval
    if config.retrieval.search_k == 0 || config.retrieval.followup_k == 0 {
        bail!("retrieval.search_k and retrieval.followup_k must be >= 1");
    }
    if config.retrieval.chunk_budget == 0 {
        bail!("retrieval.chunk_budget must be >= 1");
    }

    // Validate rerank
    if config.rerank.threshold > 10 {
        bail!("rerank.threshold must be in [0, 10]");
    }
    if config.rerank.target == 0 || config.rerank.batch_size == 0 {
        bail!("rerank.target and rerank.batch_size must be >= 1");
    }

    // Validate embedding
    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && matches!(config.embedding.dims, None | Some(0)) {
        bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        bail!("embedding.model must be specified when provider is 'openai'");
    }

    // Validate model
    match config.model.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown model provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    if config.model.is_enabled() && config.model.name.as_deref().unwrap_or("").is_empty() {
        bail!(
            "model.name must be specified when provider is '{}'",
            config.model.provider
        );
    }
    if !(0.0..=2.0).contains(&config.model.temperature) {
        bail!("model.temperature must be in [0.0, 2.0]");
    }

    if config.orchestrator.max_iterations == 0 {
        bail!("orchestrator.max_iterations must be >= 1");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/crag.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.tile_size, 2000);
        assert_eq!(config.chunking.tile_overlap, 200);
        assert_eq!(config.chunking.json_char_cap, 18000);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.retrieval.followup_k, 5);
        assert_eq!(config.rerank.threshold, 5);
        assert_eq!(config.rerank.target, 25);
        assert_eq!(config.orchestrator.max_iterations, 10);
        assert!(!config.embedding.is_enabled());
        assert!(!config.model.is_enabled());
    }

    #[test]
    fn test_overlap_must_be_below_tile_size() {
        let err = parse_config("[db]\npath = \"x\"\n[chunking]\ntile_size = 100\ntile_overlap = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("tile_overlap"));
    }

    #[test]
    fn test_enabled_model_requires_name() {
        let err = parse_config("[db]\npath = \"x\"\n[model]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("model.name"));
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\ndims = 8\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_hash_embedding_needs_dims_only() {
        let config =
            parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\ndims = 64\n").unwrap();
        assert_eq!(config.embedding.dims, Some(64));
    }
}
