//! Configuration loading

use anyhow::{Context, Result};
use offline_core::{Manifest, Release};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub site: SiteConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

/// The site being cached and the release to precache for it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Origin the front proxies to; relative precache entries resolve against it
    pub origin: String,
    #[serde(default = "default_cache_prefix")]
    pub cache_prefix: String,
    /// Bump to roll out a new cache generation
    pub version: String,
    #[serde(default = "default_offline_page")]
    pub offline_page: String,
    #[serde(default)]
    pub precache: Vec<String>,
    /// Request headers that take part in cache keys
    #[serde(default)]
    pub vary_headers: Vec<String>,
}

impl SiteConfig {
    pub fn origin_url(&self) -> Result<Url> {
        let url = Url::parse(&self.origin)
            .with_context(|| format!("Invalid site origin: {}", self.origin))?;
        if url.cannot_be_a_base() {
            anyhow::bail!("Site origin must be an absolute http(s) URL: {}", self.origin);
        }
        Ok(url)
    }

    pub fn release(&self) -> Result<Release> {
        Release::new(
            self.cache_prefix.clone(),
            self.version.clone(),
            Manifest::new(self.precache.iter().cloned()),
            self.offline_page.clone(),
        )
        .with_context(|| format!("Invalid release {}-{}", self.cache_prefix, self.version))
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "local" or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub local: LocalStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local: LocalStorageConfig::default(),
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    #[serde(default = "default_local_path")]
    pub path: String,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            path: default_local_path(),
        }
    }
}

/// Outgoing requests to the origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            skip_tls_verify: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cache_prefix() -> String {
    "selnexa-cache".to_string()
}

fn default_offline_page() -> String {
    "offline.html".to_string()
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_local_path() -> String {
    "./data/offline-cache".to_string()
}

fn default_user_agent() -> String {
    format!("offline-cache/{}", env!("CARGO_PKG_VERSION"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from a file, falling back to defaults if it is missing
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.validate()?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }

    /// Check everything that would otherwise only fail once the server runs
    pub fn validate(&self) -> Result<()> {
        let origin = self.site.origin_url()?;
        self.site
            .release()?
            .resolve(&origin)
            .with_context(|| format!("Invalid precache list for {}", self.site.origin))?;

        match self.storage.backend.as_str() {
            "local" | "memory" => {}
            other => anyhow::bail!("Unknown storage backend: {}", other),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => anyhow::bail!("Unknown log format: {}", other),
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            site: SiteConfig {
                origin: "http://localhost:3000/".to_string(),
                cache_prefix: default_cache_prefix(),
                version: "v7".to_string(),
                offline_page: default_offline_page(),
                precache: vec![
                    "./".to_string(),
                    "index.html".to_string(),
                    "for-funders.html".to_string(),
                    "offline.html".to_string(),
                    "styles/home.css".to_string(),
                    "js/home.js".to_string(),
                ],
                vary_headers: Vec::new(),
            },
            storage: StorageConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}
