//! Configuration parsing and validation.
//!
//! `gno` is configured via a TOML file (default: `~/.config/gno/config.toml`,
//! overridable with `GNO_CONFIG_DIR`). The config defines the store path,
//! the set of collections to scan, chunking parameters, model cache/lifecycle
//! tuning, the embed scheduler's debounce settings, and retrieval tuning.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub model_cache: ModelCacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    #[serde(default = "default_fts_tokenizer")]
    pub fts_tokenizer: String,
}

fn default_fts_tokenizer() -> String {
    "unicode61".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default = "default_glob_pattern")]
    pub glob_pattern: String,
    #[serde(default)]
    pub include_exts: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub update_cmd: Option<String>,
    #[serde(default)]
    pub language_hint: Option<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_glob_pattern() -> String {
    "**/*".to_string()
}

fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    #[serde(default = "default_overlap_percent")]
    pub overlap_percent: f64,
}

fn default_overlap_percent() -> f64 {
    0.15
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_keyword: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_group_by")]
    pub group_by: String,
    #[serde(default = "default_doc_agg")]
    pub doc_agg: String,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
}

fn default_hybrid_alpha() -> f64 {
    0.6
}
fn default_candidate_k() -> i64 {
    80
}
fn default_final_limit() -> i64 {
    12
}
fn default_group_by() -> String {
    "document".to_string()
}
fn default_doc_agg() -> String {
    "max".to_string()
}
fn default_max_chunks_per_doc() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `hf:`, `file:`, or `http(s)://` model URI resolved through the model
    /// cache; takes precedence over `provider`/`model` when set.
    #[serde(default)]
    pub model_uri: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            model_uri: None,
            url: None,
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

#[derive(Debug, Deserialize, Clone)]
pub struct ModelCacheConfig {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    #[serde(default = "default_lock_poll_ms")]
    pub lock_poll_ms: u64,
    #[serde(default = "default_lock_max_attempts")]
    pub lock_max_attempts: u32,
    #[serde(default = "default_warm_model_ttl_secs")]
    pub warm_model_ttl_secs: u64,
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,
}

impl Default for ModelCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            lock_ttl_secs: default_lock_ttl_secs(),
            lock_poll_ms: default_lock_poll_ms(),
            lock_max_attempts: default_lock_max_attempts(),
            warm_model_ttl_secs: default_warm_model_ttl_secs(),
            load_timeout_secs: default_load_timeout_secs(),
            inference_timeout_secs: default_inference_timeout_secs(),
        }
    }
}

fn default_lock_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_lock_poll_ms() -> u64 {
    500
}
fn default_lock_max_attempts() -> u32 {
    1200
}
fn default_warm_model_ttl_secs() -> u64 {
    10 * 60
}
fn default_load_timeout_secs() -> u64 {
    120
}
fn default_inference_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size_sync")]
    pub batch_size: usize,
    #[serde(default)]
    pub git_pull: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_size: default_batch_size_sync(),
            git_pull: false,
        }
    }
}

fn default_concurrency() -> usize {
    1
}
fn default_batch_size_sync() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_backlog_batch_size")]
    pub backlog_batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_wait_ms: default_max_wait_ms(),
            backlog_batch_size: default_backlog_batch_size(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    30_000
}
fn default_max_wait_ms() -> u64 {
    5 * 60 * 1000
}
fn default_backlog_batch_size() -> i64 {
    32
}

/// Model download policy, resolved from CLI flags and environment variables.
#[derive(Debug, Clone, Copy)]
pub struct DownloadPolicy {
    pub offline: bool,
    pub allow_download: bool,
}

impl DownloadPolicy {
    /// Precedence: CLI `--offline` > `HF_HUB_OFFLINE` > `GNO_OFFLINE` >
    /// `GNO_NO_AUTO_DOWNLOAD` > default (online, downloads allowed).
    pub fn resolve(cli_offline: bool) -> Self {
        if cli_offline || env_truthy("HF_HUB_OFFLINE") || env_truthy("GNO_OFFLINE") {
            return Self {
                offline: true,
                allow_download: false,
            };
        }
        if env_truthy("GNO_NO_AUTO_DOWNLOAD") {
            return Self {
                offline: false,
                allow_download: false,
            };
        }
        Self {
            offline: false,
            allow_download: true,
        }
    }
}

fn env_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Resolve the platform config directory, honoring `GNO_CONFIG_DIR`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GNO_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs_config_home().join("gno")
}

/// Resolve the platform data directory, honoring `GNO_DATA_DIR`.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GNO_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs_config_home().join("gno")
}

/// Resolve the model cache directory, honoring `GNO_CACHE_DIR`.
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("GNO_CACHE_DIR") {
        return PathBuf::from(dir);
    }
    dirs_config_home().join("gno").join("models")
}

fn dirs_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".config"))
                .unwrap_or_else(|_| PathBuf::from("."))
        })
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }

    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        anyhow::bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }

    for c in &config.collections {
        if c.name.is_empty() {
            anyhow::bail!("collection name must not be empty");
        }
    }

    if config.embedding.is_enabled() && config.embedding.model_uri.is_none() {
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
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_policy_defaults_to_online() {
        std::env::remove_var("HF_HUB_OFFLINE");
        std::env::remove_var("GNO_OFFLINE");
        std::env::remove_var("GNO_NO_AUTO_DOWNLOAD");
        let policy = DownloadPolicy::resolve(false);
        assert!(!policy.offline);
        assert!(policy.allow_download);
    }

    #[test]
    fn download_policy_cli_offline_wins() {
        let policy = DownloadPolicy::resolve(true);
        assert!(policy.offline);
        assert!(!policy.allow_download);
    }
}
