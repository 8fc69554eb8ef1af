//! Configuration file parser for ~/.config/newsync/config.toml.
//!
//! The config file is optional and a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged as warnings, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ingest::ExponentialBackoff;
use crate::invalidation::ReceiverConfig;
use crate::query::QueryConfig;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the news backend.
    pub api_base_url: String,

    /// Articles per page for paginated listings.
    pub page_size: u32,

    /// Seconds before a cached page is considered stale.
    pub stale_time_secs: u64,

    /// Seconds an unused cache entry is kept before it is swept.
    pub gc_time_secs: u64,

    /// Upper bound on cached query keys.
    pub max_cache_entries: usize,

    /// Retries after the first streaming attempt fails.
    pub stream_max_retries: u32,

    /// First retry delay in milliseconds; doubled for every further retry.
    pub stream_backoff_base_ms: u64,

    /// Seconds to wait before reconnecting the updates channel.
    pub reconnect_delay_secs: u64,

    /// Timeout for non-streaming HTTP requests.
    pub request_timeout_secs: u64,

    /// Send like/unlike to the backend. When off, likes stay local.
    pub liked_remote_sync: bool,

    /// Send reading queue changes to the backend.
    pub queue_remote_sync: bool,

    /// Let streaming fetches start from the backend's article cache.
    pub use_cache: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            page_size: 50,
            stale_time_secs: 30,
            gc_time_secs: 300,
            max_cache_entries: 64,
            stream_max_retries: 3,
            stream_backoff_base_ms: 2000,
            reconnect_delay_secs: 5,
            request_timeout_secs: 30,
            liked_remote_sync: true,
            queue_remote_sync: true,
            use_cache: true,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 12] = [
        "api_base_url",
        "page_size",
        "stale_time_secs",
        "gc_time_secs",
        "max_cache_entries",
        "stream_max_retries",
        "stream_backoff_base_ms",
        "reconnect_delay_secs",
        "request_timeout_secs",
        "liked_remote_sync",
        "queue_remote_sync",
        "use_cache",
    ];

    /// Default location: `$XDG_CONFIG_HOME/newsync/config.toml`, falling back to
    /// `~/.config/newsync/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
        Some(base.join("newsync").join("config.toml"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero page size or cache size → `Err(ConfigError::Invalid)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content).inspect(|config| {
            tracing::info!(
                path = %path.display(),
                api_base_url = %config.api_base_url,
                "Loaded configuration"
            );
        })
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be at least 1".into()));
        }
        if self.max_cache_entries == 0 {
            return Err(ConfigError::Invalid(
                "max_cache_entries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn query_config(&self) -> QueryConfig {
        QueryConfig {
            stale_time: Duration::from_secs(self.stale_time_secs),
            gc_time: Duration::from_secs(self.gc_time_secs),
            max_entries: self.max_cache_entries,
        }
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.stream_backoff_base_ms),
            self.stream_max_retries,
        )
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ============================================================================
// Tests
// ============================================================================
