//! Configuration management for chunked-export
//!
//! This module handles loading, parsing, and managing configuration from various sources:
//! - Configuration files (TOML format)
//! - Environment variables
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Prefix for environment overrides, e.g. `CHUNKED_EXPORT_EXPORT_CHUNK_SIZE`.
pub const ENV_PREFIX: &str = "CHUNKED_EXPORT_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Search backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Export pipeline configuration
    #[serde(default)]
    pub export: ExportConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Search backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the OpenSearch cluster
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Basic auth user
    #[serde(default)]
    pub username: Option<String>,

    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,

    /// Index pattern searched by exports
    #[serde(default = "default_index")]
    pub index: String,

    /// Time zone applied to the timestamp range
    #[serde(default = "default_time_zone")]
    pub time_zone: String,

    /// Field holding the menu / log type
    #[serde(default = "default_log_type_field")]
    pub log_type_field: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Scroll keep-alive in seconds, renewed by every batch
    #[serde(default = "default_scroll_ttl")]
    pub scroll_ttl: u64,

    /// Rows requested per scroll batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// PEM bundle used to verify the cluster certificate
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,

    /// Skip certificate verification (development clusters only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Export pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Maximum rows per chunk file
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Directory holding generated chunk files
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Chunks generated at the same time
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,

    /// Minimum spacing of progress ticks per chunk, in milliseconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_ms: u64,

    /// Delay before a fully downloaded session is removed, in seconds
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay: u64,

    /// Time granted to workers to settle after cancel, in seconds
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace: u64,

    /// Idle time after which the sweeper removes a session, in seconds
    #[serde(default = "default_session_idle")]
    pub session_idle: u64,

    /// Wait before a disconnect cancels an export, in milliseconds
    #[serde(default)]
    pub reconnect_grace_ms: u64,

    /// Fields never written to CSV
    #[serde(default = "default_excluded_columns")]
    pub excluded_columns: Vec<String>,

    /// Fixed column list; when unset the first row decides
    #[serde(default)]
    pub columns: Option<Vec<String>>,
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval of the idle-session sweeper, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// Age after which search session records are purged, in minutes
    #[serde(default = "default_search_session_max_age")]
    pub search_session_max_age: u64,

    /// Minimum spacing of persisted-status polls during a search, in milliseconds
    #[serde(default = "default_search_poll_interval")]
    pub search_poll_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_backend_url() -> String {
    "https://localhost:9200".to_string()
}

fn default_index() -> String {
    "logs-*".to_string()
}

fn default_time_zone() -> String {
    "+09:00".to_string()
}

fn default_log_type_field() -> String {
    "logType".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_scroll_ttl() -> u64 {
    120
}

fn default_batch_size() -> usize {
    10_000
}

fn default_chunk_size() -> u64 {
    500_000
}

fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("chunked-export")
}

fn default_max_concurrent_chunks() -> usize {
    4
}

fn default_progress_interval() -> u64 {
    500
}

fn default_cleanup_delay() -> u64 {
    300
}

fn default_cancel_grace() -> u64 {
    10
}

fn default_session_idle() -> u64 {
    3600
}

fn default_excluded_columns() -> Vec<String> {
    vec!["message".to_string()]
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_search_session_max_age() -> u64 {
    30
}

fn default_search_poll_interval() -> u64 {
    1000
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            username: None,
            password: None,
            index: default_index(),
            time_zone: default_time_zone(),
            log_type_field: default_log_type_field(),
            request_timeout: default_request_timeout(),
            scroll_ttl: default_scroll_ttl(),
            batch_size: default_batch_size(),
            ca_cert_path: None,
            accept_invalid_certs: false,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            download_dir: default_download_dir(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            progress_interval_ms: default_progress_interval(),
            cleanup_delay: default_cleanup_delay(),
            cancel_grace: default_cancel_grace(),
            session_idle: default_session_idle(),
            reconnect_grace_ms: 0,
            excluded_columns: default_excluded_columns(),
            columns: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            sweep_interval: default_sweep_interval(),
            search_session_max_age: default_search_session_max_age(),
            search_poll_interval_ms: default_search_poll_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Load configuration from multiple sources with proper precedence
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`
    ///
    /// Recognizes `CHUNKED_EXPORT_<SECTION>_<FIELD>` plus the plain
    /// `OPENSEARCH_URL`, `OPENSEARCH_USERNAME`, `OPENSEARCH_PASSWORD`,
    /// `CA_CERT_PATH`, `CHUNK_SIZE` and `PORT` variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |plain: &str, field: &str| {
            lookup(&format!("{ENV_PREFIX}{field}")).or_else(|| {
                if plain.is_empty() {
                    None
                } else {
                    lookup(plain)
                }
            })
        };

        if let Some(v) = get("OPENSEARCH_URL", "BACKEND_URL") {
            self.backend.url = v;
        }
        if let Some(v) = get("OPENSEARCH_USERNAME", "BACKEND_USERNAME") {
            self.backend.username = Some(v);
        }
        if let Some(v) = get("OPENSEARCH_PASSWORD", "BACKEND_PASSWORD") {
            self.backend.password = Some(v);
        }
        if let Some(v) = get("", "BACKEND_INDEX") {
            self.backend.index = v;
        }
        if let Some(v) = get("", "BACKEND_TIME_ZONE") {
            self.backend.time_zone = v;
        }
        if let Some(v) = get("CA_CERT_PATH", "BACKEND_CA_CERT_PATH") {
            self.backend.ca_cert_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("", "BACKEND_BATCH_SIZE") {
            self.backend.batch_size = parse_env("backend.batch_size", &v)?;
        }
        if let Some(v) = get("", "BACKEND_SCROLL_TTL") {
            self.backend.scroll_ttl = parse_env("backend.scroll_ttl", &v)?;
        }
        if let Some(v) = get("CHUNK_SIZE", "EXPORT_CHUNK_SIZE") {
            self.export.chunk_size = parse_env("export.chunk_size", &v)?;
        }
        if let Some(v) = get("", "EXPORT_DOWNLOAD_DIR") {
            self.export.download_dir = PathBuf::from(v);
        }
        if let Some(v) = get("", "EXPORT_MAX_CONCURRENT_CHUNKS") {
            self.export.max_concurrent_chunks = parse_env("export.max_concurrent_chunks", &v)?;
        }
        if let Some(v) = get("", "SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("PORT", "SERVER_PORT") {
            self.server.port = parse_env("server.port", &v)?;
        }
        if let Some(v) = get("", "LOGGING_LEVEL") {
            self.logging.level = LogLevel::from_str(&v)?;
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chunked-export")
            .join("config.toml")
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.backend.url.trim().is_empty() {
            return Err(invalid("backend.url", &self.backend.url));
        }
        if self.backend.batch_size == 0 {
            return Err(invalid("backend.batch_size", "0"));
        }
        if self.backend.scroll_ttl == 0 {
            return Err(invalid("backend.scroll_ttl", "0"));
        }
        if self.export.chunk_size == 0 {
            return Err(invalid("export.chunk_size", "0"));
        }
        if self.export.max_concurrent_chunks == 0 {
            return Err(invalid("export.max_concurrent_chunks", "0"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.backend.request_timeout)
    }

    pub fn scroll_ttl(&self) -> Duration {
        Duration::from_secs(self.backend.scroll_ttl)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.export.progress_interval_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.export.cleanup_delay)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.export.cancel_grace)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.export.session_idle)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.export.reconnect_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.server.sweep_interval)
    }

    pub fn search_poll_interval(&self) -> Duration {
        Duration::from_millis(self.server.search_poll_interval_ms)
    }
}

fn invalid(field: &str, value: &str) -> crate::error::ExportError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

fn parse_env<T: FromStr>(field: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(field, value))
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = crate::error::ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(invalid("logging.level", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.export.chunk_size, 500_000);
        assert_eq!(config.backend.batch_size, 10_000);
        assert_eq!(config.backend.time_zone, "+09:00");
        assert_eq!(config.export.excluded_columns, vec!["message".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [export]
            chunk_size = 1000

            [backend]
            url = "http://search:9200"
            "#,
        )
        .unwrap();

        assert_eq!(config.export.chunk_size, 1000);
        assert_eq!(config.export.max_concurrent_chunks, 4);
        assert_eq!(config.backend.url, "http://search:9200");
        assert_eq!(config.server.port, 3001);
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::from_toml_str("[export\nchunk_size = ").unwrap_err();
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENSEARCH_URL", "http://plain:9200"),
            ("CHUNKED_EXPORT_BACKEND_URL", "http://prefixed:9200"),
            ("CHUNK_SIZE", "250"),
            ("PORT", "8088"),
            ("CHUNKED_EXPORT_LOGGING_LEVEL", "debug"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.backend.url, "http://prefixed:9200");
        assert_eq!(config.export.chunk_size, 250);
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let result = config.apply_env(|k| (k == "CHUNK_SIZE").then(|| "lots".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = Config::default();
        config.export.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/definitely/not/here.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_round_trip_through_show() {
        let config = Config::default();
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("chunk_size = 500000"));
    }
}
