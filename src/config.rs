// asset-sync/src/config.rs

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::download::{OptimiseSettings, ResolverSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[serde(default = "default_variants")]
    pub variants: Vec<String>,
    #[serde(default)]
    pub assets: AssetsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default = "default_prefetch_capacity")]
    pub prefetch_capacity: usize,
    #[serde(default = "default_failure_log_max_entries")]
    pub failure_log_max_entries: usize,
    /// `class:value,...`, from `ASSET_SYNC_CONCURRENCY`.
    #[serde(skip)]
    pub concurrency_override: Option<String>,
    /// From `ASSET_SYNC_FORCE` or `--force`.
    #[serde(skip)]
    pub force: bool,
}

impl Config {
    pub fn trace_loaded(&self) {
        info!(
            manifest = %self.source.manifest.display(),
            output_dir = %self.output_dir.display(),
            cache_dir = %self.cache_dir.display(),
            variants = ?self.variants,
            force = self.force,
            concurrency_override = self.concurrency_override.as_deref().unwrap_or(""),
            "Loaded Config"
        );
        debug!(?self, "Config loaded (full debug)");
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.batch.item_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// JSON manifest listing the items to ingest.
    pub manifest: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub url_prefix: String,
    pub allowed_schemes: Vec<String>,
    pub allowed_hosts: Vec<String>,
    /// Regexes marking expiring links. Empty uses the built-in signed-URL set.
    pub forbidden_patterns: Vec<String>,
    pub max_dimension: u32,
    pub compress_timeout_ms: u64,
    pub download_attempts: u32,
    pub backoff_base_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            url_prefix: "/assets/".to_string(),
            allowed_schemes: vec!["https".to_string(), "http".to_string()],
            allowed_hosts: Vec::new(),
            forbidden_patterns: Vec::new(),
            max_dimension: 2048,
            compress_timeout_ms: 5000,
            download_attempts: 3,
            backoff_base_ms: 500,
            request_timeout_ms: 30_000,
        }
    }
}

impl AssetsConfig {
    pub fn resolver_settings(&self) -> ResolverSettings {
        let backoff_base = Duration::from_millis(self.backoff_base_ms);
        ResolverSettings {
            url_prefix: self.url_prefix.clone(),
            allowed_schemes: self.allowed_schemes.clone(),
            allowed_hosts: self.allowed_hosts.clone(),
            download_attempts: self.download_attempts,
            backoff_base,
            backoff_jitter: backoff_base / 2,
            optimise: OptimiseSettings {
                max_dimension: self.max_dimension,
                compress_timeout: Duration::from_millis(self.compress_timeout_ms),
                ..OptimiseSettings::default()
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// `None` disables the per-item timeout.
    pub item_timeout_ms: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            item_timeout_ms: Some(120_000),
        }
    }
}

fn default_variants() -> Vec<String> {
    vec!["en".to_string()]
}

fn default_prefetch_capacity() -> usize {
    256
}

fn default_failure_log_max_entries() -> usize {
    1000
}

/// Hash over the crate version and every setting that changes output text.
/// A different fingerprint invalidates the sync ledger.
pub fn pipeline_fingerprint(config: &Config) -> String {
    let mut hasher = Sha256::new();
    hasher.update(env!("CARGO_PKG_VERSION").as_bytes());
    let mut field = |name: &str, value: &str| {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    };
    field("variants", &config.variants.join(","));
    field("url_prefix", &config.assets.url_prefix);
    field("forbidden_patterns", &config.assets.forbidden_patterns.join("\n"));
    field("max_dimension", &config.assets.max_dimension.to_string());
    format!("{:x}", hasher.finalize())
}
