use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError as ConfigCrateError, Environment, File};
use serde::Deserialize;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub limit: LimitConfig,
    #[serde(default)]
    pub blocklist: BlocklistConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Comma-separated inference worker addresses (e.g. "host1:50051,host2:50051").
    /// Empty disables the inference endpoint.
    #[serde(default = "default_worker_addresses")]
    pub addresses: String,
    /// Maximum duration of one inference request.
    #[serde(default = "default_inference_timeout_secs")]
    pub inference_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitConfig {
    /// Requests per minute per client.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Burst size for the rate limiter.
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlocklistConfig {
    #[serde(default = "default_blocklist_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Upstream connection dial timeout.
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Defaults
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_shutdown_timeout_secs() -> u64 { 30 }
fn default_worker_addresses() -> String { String::new() }
fn default_inference_timeout_secs() -> u64 { 300 }
fn default_requests_per_minute() -> u32 { 100 }
fn default_rate_burst() -> u32 { 20 }
fn default_blocklist_path() -> String { "configs/blocklist.json".to_string() }
fn default_dial_timeout_secs() -> u64 { 10 }
fn default_log_level() -> String { "info".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            workers: WorkersConfig::default(),
            limit: LimitConfig::default(),
            blocklist: BlocklistConfig::default(),
            proxy: ProxyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            addresses: default_worker_addresses(),
            inference_timeout_secs: default_inference_timeout_secs(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            burst: default_rate_burst(),
        }
    }
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self { path: default_blocklist_path() }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { dial_timeout_secs: default_dial_timeout_secs() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl WorkersConfig {
    /// Worker address list, split and trimmed. Empty entries are dropped.
    pub fn parsed_addresses(&self) -> Vec<String> {
        self.addresses
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }
}

impl ProxyConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    LoadError(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::LoadError(err.to_string())
    }
}

impl Config {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Load configuration from config.toml (if it exists) and environment
    /// variables. Environment variables override file settings.
    /// Env var format: GATEWAY__SECTION__KEY (e.g. GATEWAY__WORKERS__ADDRESSES).
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("host", default_host())?
            .set_default("port", default_port() as i64)?
            .set_default("shutdown_timeout_secs", default_shutdown_timeout_secs() as i64)?
            .set_default("workers.addresses", default_worker_addresses())?
            .set_default(
                "workers.inference_timeout_secs",
                default_inference_timeout_secs() as i64,
            )?
            .set_default(
                "limit.requests_per_minute",
                default_requests_per_minute() as i64,
            )?
            .set_default("limit.burst", default_rate_burst() as i64)?
            .set_default("blocklist.path", default_blocklist_path())?
            .set_default("proxy.dial_timeout_secs", default_dial_timeout_secs() as i64)?
            .set_default("logging.level", default_log_level())?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(ConfigError::from)
    }
}
