use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub partitioning: PartitioningConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Index used when an upload or query names none.
    #[serde(default = "default_index")]
    pub default_index: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_index: default_index(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}
fn default_index() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArtifactsConfig {
    /// `"fs"` or `"memory"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_artifacts_root")]
    pub root: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_artifacts_root(),
        }
    }
}

fn default_backend() -> String {
    "fs".to_string()
}
fn default_artifacts_root() -> PathBuf {
    PathBuf::from("./data/artifacts")
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// `"fs"` or `"memory"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_queue_root")]
    pub root: PathBuf,
    /// Nacks tolerated before a message is dead-lettered.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Lease duration. Must exceed the handler deadline, with margin.
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    /// Worker sleep floor when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_queue_root(),
            max_attempts: default_max_attempts(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_queue_root() -> PathBuf {
    PathBuf::from("./data/queue")
}
fn default_max_attempts() -> u32 {
    20
}
fn default_visibility_timeout_ms() -> u64 {
    120_000
}
fn default_poll_interval_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Soft deadline for one handler invocation; overrun is retried.
    #[serde(default = "default_handler_deadline_ms")]
    pub handler_deadline_ms: u64,
    /// Exponential retry backoff base.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Exponential retry backoff cap.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            handler_deadline_ms: default_handler_deadline_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_handler_deadline_ms() -> u64 {
    60_000
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_cap_ms() -> u64 {
    300_000
}
fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct PartitioningConfig {
    pub max_tokens: usize,
}

impl Default for PartitioningConfig {
    fn default() -> Self {
        Self { max_tokens: 700 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the ollama provider.
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
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            base_url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
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

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: i64,
    /// Chunks fed to answer synthesis.
    #[serde(default = "default_ask_top_k")]
    pub ask_top_k: usize,
    #[serde(default)]
    pub min_relevance: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            ask_top_k: default_ask_top_k(),
            min_relevance: 0.0,
        }
    }
}

fn default_search_limit() -> i64 {
    10
}
fn default_ask_top_k() -> usize {
    5
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    match config.artifacts.backend.as_str() {
        "fs" | "memory" => {}
        other => anyhow::bail!("Unknown artifacts backend: '{}'. Must be fs or memory.", other),
    }
    match config.queue.backend.as_str() {
        "fs" | "memory" => {}
        other => anyhow::bail!("Unknown queue backend: '{}'. Must be fs or memory.", other),
    }

    if config.pipeline.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }
    if config.partitioning.max_tokens == 0 {
        anyhow::bail!("partitioning.max_tokens must be > 0");
    }
    if config.pipeline.retry_base_ms == 0 || config.pipeline.retry_base_ms > config.pipeline.retry_cap_ms {
        anyhow::bail!("pipeline.retry_base_ms must be > 0 and <= pipeline.retry_cap_ms");
    }

    // A lease must outlive a handler invocation, or two workers could
    // run the same document at once.
    if config.queue.visibility_timeout_ms <= config.pipeline.handler_deadline_ms {
        anyhow::bail!(
            "queue.visibility_timeout_ms ({}) must exceed pipeline.handler_deadline_ms ({})",
            config.queue.visibility_timeout_ms,
            config.pipeline.handler_deadline_ms
        );
    }

    if config.service.default_index.trim().is_empty() {
        anyhow::bail!("service.default_index must not be empty");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}
