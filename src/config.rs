//! TOML configuration for the `ragline` application.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] parses and validates; validation errors name the
//! offending key.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ragline_core::chunk::ChunkOptions;
use ragline_core::search::{
    ContextBudget, RetrievalOptions, ScoreCombiner, DEFAULT_SEMANTIC_WEIGHT,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub trace: TraceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_lookback_fraction")]
    pub lookback_fraction: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_fraction: default_overlap_fraction(),
            min_chars: default_min_chars(),
            lookback_fraction: default_lookback_fraction(),
        }
    }
}

impl ChunkingConfig {
    pub fn to_options(&self) -> ChunkOptions {
        ChunkOptions {
            overlap_fraction: self.overlap_fraction,
            min_chars: self.min_chars,
            lookback_fraction: self.lookback_fraction,
            ..ChunkOptions::from_tokens(self.max_tokens)
        }
    }
}

fn default_max_tokens() -> usize {
    700
}
fn default_overlap_fraction() -> f64 {
    0.15
}
fn default_min_chars() -> usize {
    16
}
fn default_lookback_fraction() -> f64 {
    0.3
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
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
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
            max_concurrency: default_max_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Minimum raw cosine for semantic candidates.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_k")]
    pub keyword_limit: usize,
    #[serde(default = "default_combiner")]
    pub combiner: String,
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub max_context_chars: Option<usize>,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            top_k: default_top_k(),
            keyword_limit: default_top_k(),
            combiner: default_combiner(),
            semantic_weight: default_semantic_weight(),
            max_results: default_max_results(),
            max_context_chars: None,
            search_timeout_ms: default_search_timeout_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn to_options(&self) -> Result<RetrievalOptions> {
        let combiner = ScoreCombiner::from_name(&self.combiner, self.semantic_weight)
            .context("retrieval.combiner")?;
        Ok(RetrievalOptions {
            threshold: self.threshold,
            top_k: self.top_k,
            keyword_limit: self.keyword_limit,
            combiner,
            budget: ContextBudget {
                max_results: self.max_results,
                max_chars: self.max_context_chars,
            },
        })
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

fn default_threshold() -> f64 {
    0.25
}
fn default_top_k() -> usize {
    20
}
fn default_combiner() -> String {
    "max".to_string()
}
fn default_semantic_weight() -> f64 {
    DEFAULT_SEMANTIC_WEIGHT
}
fn default_max_results() -> usize {
    8
}
fn default_search_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_parallel_documents")]
    pub max_parallel_documents: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_parallel_documents: default_max_parallel_documents(),
        }
    }
}

fn default_max_parallel_documents() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct TraceConfig {
    #[serde(default = "default_trace_capacity")]
    pub capacity: usize,
    /// Persist events to the `trace_events` table in the background.
    #[serde(default)]
    pub persist: bool,
    #[serde(default = "default_trace_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            capacity: default_trace_capacity(),
            persist: false,
            batch_size: default_trace_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_trace_capacity() -> usize {
    ragline_core::trace::DEFAULT_TRACE_CAPACITY
}
fn default_trace_batch_size() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_queue_capacity() -> usize {
    1024
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

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if !(0.0..=0.5).contains(&config.chunking.overlap_fraction) {
        bail!("chunking.overlap_fraction must be in [0.0, 0.5]");
    }
    if !(0.0..0.5).contains(&config.chunking.lookback_fraction) {
        bail!("chunking.lookback_fraction must be in [0.0, 0.5)");
    }

    // Embedding
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
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.max_concurrency == 0 {
        bail!("embedding.max_concurrency must be > 0");
    }
    if config.embedding.timeout_secs == 0 {
        bail!("embedding.timeout_secs must be > 0");
    }

    // Retrieval
    if !(-1.0..=1.0).contains(&config.retrieval.threshold) {
        bail!("retrieval.threshold must be in [-1.0, 1.0]");
    }
    if config.retrieval.max_results < 1 {
        bail!("retrieval.max_results must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.semantic_weight) {
        bail!("retrieval.semantic_weight must be in [0.0, 1.0]");
    }
    if config.retrieval.max_context_chars == Some(0) {
        bail!("retrieval.max_context_chars must be > 0 when set");
    }
    config.retrieval.to_options()?;

    // Ingest and trace
    if config.ingest.max_parallel_documents == 0 {
        bail!("ingest.max_parallel_documents must be > 0");
    }
    if config.trace.capacity == 0 {
        bail!("trace.capacity must be > 0");
    }
    if config.trace.batch_size == 0 {
        bail!("trace.batch_size must be > 0");
    }
    if config.trace.queue_capacity == 0 {
        bail!("trace.queue_capacity must be > 0");
    }

    Ok(())
}
