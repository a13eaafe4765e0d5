//! TOML configuration.
//!
//! Every section except `[db]` is optional; missing fields fall back to the
//! `default_*` functions below. [`load_config`] parses the file and rejects
//! values that would put the pipeline in an undefined state.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl Config {
    /// A config rooted at `root` with every other setting at its default.
    ///
    /// The database lands in `root/data/rag.sqlite` and uploads under
    /// `root/uploads`.
    pub fn with_root(root: &Path) -> Self {
        Self {
            db: DbConfig {
                path: root.join("data").join("rag.sqlite"),
            },
            storage: StorageConfig {
                root: root.join("uploads"),
                ..StorageConfig::default()
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            context: ContextConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            conversation: ConversationConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            max_file_size_bytes: default_max_file_size(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

/// How extracted text is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkStrategy {
    #[serde(alias = "fixed_size")]
    FixedSize,
    #[serde(alias = "semantic")]
    Semantic,
    #[serde(alias = "sliding_window")]
    SlidingWindow,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::FixedSize => "FIXED_SIZE",
            ChunkStrategy::Semantic => "SEMANTIC",
            ChunkStrategy::SlidingWindow => "SLIDING_WINDOW",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "FIXED_SIZE" => Ok(ChunkStrategy::FixedSize),
            "SEMANTIC" => Ok(ChunkStrategy::Semantic),
            "SLIDING_WINDOW" => Ok(ChunkStrategy::SlidingWindow),
            other => Err(format!(
                "unknown chunk strategy '{}': expected FIXED_SIZE, SEMANTIC, or SLIDING_WINDOW",
                other
            )),
        }
    }
}

/// Chunk sizing in tokens. Tenants may override any of these; the chunker
/// always receives a fully resolved value.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    #[serde(default = "default_strategy")]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be > 0".to_string());
        }
        if self.overlap >= self.chunk_size {
            return Err(format!(
                "overlap ({}) must be smaller than chunk_size ({})",
                self.overlap, self.chunk_size
            ));
        }
        Ok(())
    }
}

fn default_strategy() -> ChunkStrategy {
    ChunkStrategy::FixedSize
}
fn default_chunk_size() -> usize {
    512
}
fn default_overlap() -> usize {
    64
}

/// Retrieval strategy for `search`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    pub fn needs_embeddings(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!(
                "unknown search mode '{}'. Use keyword, semantic, or hybrid.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::default(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            hybrid_alpha: default_hybrid_alpha(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f64 {
    0.7
}
fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_context_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_context_tokens(),
            separator: default_separator(),
        }
    }
}

fn default_context_tokens() -> usize {
    4000
}
fn default_separator() -> String {
    "\n\n---\n\n".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Secondary provider tried when the primary fails.
    #[serde(default)]
    pub fallback: Option<LlmFallbackConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmFallbackConfig {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_tokens: default_llm_max_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            connect_timeout_secs: default_connect_timeout_secs(),
            timeout_secs: default_llm_timeout_secs(),
            fallback: None,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_llm_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,
    #[serde(default = "default_response_ttl")]
    pub response_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            embedding_ttl_secs: default_embedding_ttl(),
            response_ttl_secs: default_response_ttl(),
        }
    }
}

fn default_embedding_ttl() -> u64 {
    24 * 60 * 60
}
fn default_response_ttl() -> u64 {
    60 * 60
}

/// Conversation history kept for follow-up questions.
#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Exchanges kept per conversation; older ones are dropped.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    /// Recent exchanges folded into a follow-up question.
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    #[serde(default = "default_conversation_ttl")]
    pub ttl_secs: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_history: default_max_history(),
            context_window: default_context_window(),
            ttl_secs: default_conversation_ttl(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_history() -> usize {
    20
}
fn default_context_window() -> usize {
    5
}
fn default_conversation_ttl() -> u64 {
    24 * 60 * 60
}

/// Clean-up applied to a question before retrieval.
#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_true")]
    pub optimize: bool,
    #[serde(default = "default_true")]
    pub expand_acronyms: bool,
    #[serde(default)]
    pub remove_stopwords: bool,
    /// An optimized query shorter than this falls back to the original.
    #[serde(default = "default_min_query_length")]
    pub min_length: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            optimize: true,
            expand_acronyms: true,
            remove_stopwords: false,
            min_length: default_min_query_length(),
        }
    }
}

fn default_min_query_length() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default)]
    pub run_workers_in_server: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            visibility_timeout_secs: default_visibility_timeout(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            claim_batch: default_claim_batch(),
            worker_concurrency: default_worker_concurrency(),
            run_workers_in_server: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_visibility_timeout() -> u64 {
    60
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_retry_max_ms() -> u64 {
    5 * 60 * 1000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_claim_batch() -> usize {
    16
}
fn default_worker_concurrency() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read, parse, and [`validate`] a TOML config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Reject settings that would leave the pipeline in an undefined state.
pub fn validate(config: &Config) -> Result<()> {
    if let Err(e) = config.chunking.validate() {
        bail!("chunking: {}", e);
    }

    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.similarity_threshold) {
        bail!("retrieval.similarity_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    if config.context.max_tokens == 0 {
        bail!("context.max_tokens must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    validate_llm_provider("llm.provider", &config.llm.provider, &config.llm.model)?;
    if let Some(fallback) = &config.llm.fallback {
        if fallback.provider == "disabled" {
            bail!("llm.fallback.provider must not be 'disabled'");
        }
        validate_llm_provider("llm.fallback.provider", &fallback.provider, &fallback.model)?;
    }

    if config.cache.embedding_ttl_secs == 0 || config.cache.response_ttl_secs == 0 {
        bail!("cache TTLs must be > 0");
    }
    if config.queue.max_attempts < 1 {
        bail!("queue.max_attempts must be >= 1");
    }
    if config.queue.worker_concurrency < 1 {
        bail!("queue.worker_concurrency must be >= 1");
    }
    if config.conversation.enabled {
        if config.conversation.max_history < 1 {
            bail!("conversation.max_history must be >= 1");
        }
        if config.conversation.ttl_secs == 0 {
            bail!("conversation.ttl_secs must be > 0");
        }
    }

    Ok(())
}

fn validate_llm_provider(field: &str, provider: &str, model: &Option<String>) -> Result<()> {
    match provider {
        "disabled" => Ok(()),
        "openai" | "ollama" => {
            if model.is_none() {
                bail!("{}: a model must be specified for '{}'", field, provider);
            }
            Ok(())
        }
        other => bail!(
            "Unknown {}: '{}'. Must be disabled, openai, or ollama.",
            field,
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/rag.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.overlap, 64);
        assert_eq!(config.chunking.strategy, ChunkStrategy::FixedSize);
        assert_eq!(config.retrieval.mode, SearchMode::Keyword);
        assert_eq!(config.queue.max_attempts, 3);
        assert!(config.cache.response_ttl_secs < config.cache.embedding_ttl_secs);
        assert!(!config.embedding.is_enabled());
        assert!(config.conversation.enabled);
        assert_eq!(config.conversation.max_history, 20);
        assert_eq!(config.conversation.context_window, 5);
        assert!(config.query.optimize);
        assert!(!config.query.remove_stopwords);
    }

    #[test]
    fn test_conversation_history_must_be_positive() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[conversation]\nmax_history = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("conversation.max_history"));

        let config = parse(
            "[db]\npath = \"x.sqlite\"\n[conversation]\nenabled = false\nmax_history = 0\n",
        )
        .unwrap();
        assert!(!config.conversation.enabled);
    }

    #[test]
    fn test_strategy_accepts_both_spellings() {
        let config = parse(
            "[db]\npath = \"x.sqlite\"\n[chunking]\nstrategy = \"sliding_window\"\n",
        )
        .unwrap();
        assert_eq!(config.chunking.strategy, ChunkStrategy::SlidingWindow);

        let config =
            parse("[db]\npath = \"x.sqlite\"\n[chunking]\nstrategy = \"SEMANTIC\"\n").unwrap();
        assert_eq!(config.chunking.strategy, ChunkStrategy::Semantic);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[chunking]\nchunk_size = 10\noverlap = 10\n")
            .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_enabled_embedding_requires_model_and_dims() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn test_unknown_llm_provider_rejected() {
        let err =
            parse("[db]\npath = \"x.sqlite\"\n[llm]\nprovider = \"bard\"\n").unwrap_err();
        assert!(err.to_string().contains("llm.provider"));
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[retrieval]\nsimilarity_threshold = 1.5\n")
            .unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "fixed-size".parse::<ChunkStrategy>().unwrap(),
            ChunkStrategy::FixedSize
        );
        assert!("paragraph".parse::<ChunkStrategy>().is_err());
    }
}
