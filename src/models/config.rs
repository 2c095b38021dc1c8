//! Application configuration structures.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Largest bulk write the document store accepts.
pub const MAX_BATCH_WRITES: usize = 500;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Paging, hydration and call-bound settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Upstream API endpoint and credentials
    #[serde(default)]
    pub api: ApiConfig,

    /// Per-job upstream call budget
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Per-job lease settings
    #[serde(default)]
    pub lease: LeaseConfig,

    /// Document store and blob locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Owners with elevated capabilities
    #[serde(default)]
    pub access: AccessConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Apply environment overrides used by the serverless deployment.
    pub fn apply_env(&mut self) {
        if let Some(secs) = env_parse("CALL_TIMEOUT_SECS") {
            self.crawler.call_timeout_secs = secs;
        }
        if let Some(n) = env_parse("MAX_CONCURRENT") {
            self.crawler.max_concurrent = n;
        }
        if let Ok(dir) = std::env::var("STORE_PATH") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Ok(token) = std::env::var("GRAPH_API_BEARER_TOKEN") {
            self.api.bearer_token = Some(token);
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.page_size == 0 {
            return Err(AppError::validation("crawler.page_size must be > 0"));
        }
        if self.crawler.write_batch_size == 0 || self.crawler.write_batch_size > MAX_BATCH_WRITES {
            return Err(AppError::validation(format!(
                "crawler.write_batch_size must be within 1..={MAX_BATCH_WRITES}"
            )));
        }
        if self.crawler.call_timeout_secs == 0 {
            return Err(AppError::validation("crawler.call_timeout_secs must be > 0"));
        }
        if self.crawler.max_concurrent == 0 {
            return Err(AppError::validation("crawler.max_concurrent must be > 0"));
        }
        if self.throttle.enabled && (self.throttle.calls_per_window == 0 || self.throttle.window_secs == 0) {
            return Err(AppError::validation(
                "throttle.calls_per_window and throttle.window_secs must be > 0",
            ));
        }
        if self.lease.ttl_secs <= self.crawler.call_timeout_secs {
            return Err(AppError::validation(
                "lease.ttl_secs must exceed crawler.call_timeout_secs",
            ));
        }
        url::Url::parse(&self.api.base_url)?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Paging and call-bound settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for upstream requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Ids requested per page (upstream maximum)
    #[serde(default = "defaults::page_size")]
    pub page_size: u32,

    /// Children with at most this many friends/followers get their id lists inlined
    #[serde(default = "defaults::inline_expansion_limit")]
    pub inline_expansion_limit: u64,

    /// Child tasks per bulk write
    #[serde(default = "defaults::write_batch_size")]
    pub write_batch_size: usize,

    /// Jobs advanced in parallel within one invocation
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Bound on each upstream or store call
    #[serde(default = "defaults::call_timeout")]
    pub call_timeout_secs: u64,
}

impl CrawlerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            page_size: defaults::page_size(),
            inline_expansion_limit: defaults::inline_expansion_limit(),
            write_batch_size: defaults::write_batch_size(),
            max_concurrent: defaults::max_concurrent(),
            call_timeout_secs: defaults::call_timeout(),
        }
    }
}

/// Upstream API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "defaults::api_base_url")]
    pub base_url: String,

    /// App-only bearer token
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::api_base_url(),
            bearer_token: None,
        }
    }
}

/// Token-bucket settings matching the upstream quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    #[serde(default = "defaults::calls_per_window")]
    pub calls_per_window: u32,

    #[serde(default = "defaults::window_secs")]
    pub window_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::enabled(),
            calls_per_window: defaults::calls_per_window(),
            window_secs: defaults::window_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "defaults::lease_ttl")]
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: defaults::lease_ttl(),
        }
    }
}

/// Where jobs and graph files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "defaults::data_dir")]
    pub data_dir: PathBuf,

    /// Document store snapshot, relative to `data_dir`
    #[serde(default = "defaults::store_file")]
    pub store_file: String,

    /// Blob key prefix for graph files
    #[serde(default = "defaults::graph_prefix")]
    pub graph_prefix: String,
}

impl StorageConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.store_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: defaults::data_dir(),
            store_file: defaults::store_file(),
            graph_prefix: defaults::graph_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessConfig {
    #[serde(default)]
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Crawler defaults
    pub fn user_agent() -> String {
        "graph-crawler/0.1".into()
    }
    pub fn page_size() -> u32 {
        5000
    }
    pub fn inline_expansion_limit() -> u64 {
        5000
    }
    pub fn write_batch_size() -> usize {
        super::MAX_BATCH_WRITES
    }
    pub fn max_concurrent() -> usize {
        4
    }
    pub fn call_timeout() -> u64 {
        30
    }

    // API defaults
    pub fn api_base_url() -> String {
        "https://api.twitter.com/1.1/".into()
    }

    // Throttle defaults: 15 calls per 15 minutes
    pub fn enabled() -> bool {
        true
    }
    pub fn calls_per_window() -> u32 {
        15
    }
    pub fn window_secs() -> u64 {
        900
    }

    pub fn lease_ttl() -> u64 {
        120
    }

    // Storage defaults
    pub fn data_dir() -> PathBuf {
        PathBuf::from("storage")
    }
    pub fn store_file() -> String {
        "jobs.json".into()
    }
    pub fn graph_prefix() -> String {
        "graphs".into()
    }

    pub fn log_level() -> String {
        "info".into()
    }
}
