//! Configuration for mailidx

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// IMAP configuration
    #[serde(default)]
    pub imap: ImapConfig,

    /// Search index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// IMAP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// Listen address and port
    #[serde(default = "default_imap_bind")]
    pub bind: String,

    /// Idle timeout in minutes
    #[serde(default = "default_imap_timeout")]
    pub timeout_minutes: u64,

    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Login name; any name is accepted when unset
    pub user: Option<String>,

    /// Argon2 PHC hash of the password; any password is accepted when unset
    pub password_hash: Option<String>,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            bind: default_imap_bind(),
            timeout_minutes: default_imap_timeout(),
            max_clients: default_max_clients(),
            user: None,
            password_hash: None,
        }
    }
}

fn default_imap_bind() -> String {
    "0.0.0.0:143".to_string()
}

fn default_imap_timeout() -> u64 {
    30
}

fn default_max_clients() -> usize {
    10
}

/// Search index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Engine name: "tantivy" or "sqlite"
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Directory holding the index, the flag store and the mail store state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub tantivy: TantivyConfig,

    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            data_dir: default_data_dir(),
            tantivy: TantivyConfig::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

fn default_engine() -> String {
    "tantivy".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/mailidx")
}

/// tantivy engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TantivyConfig {
    /// Memory budget handed to the index writer
    #[serde(default = "default_writer_heap_bytes")]
    pub writer_heap_bytes: usize,

    /// Buffered body characters that force a commit during a rebuild
    #[serde(default = "default_sync_threshold_chars")]
    pub sync_threshold_chars: usize,
}

impl Default for TantivyConfig {
    fn default() -> Self {
        Self {
            writer_heap_bytes: default_writer_heap_bytes(),
            sync_threshold_chars: default_sync_threshold_chars(),
        }
    }
}

fn default_writer_heap_bytes() -> usize {
    50_000_000
}

fn default_sync_threshold_chars() -> usize {
    500_000
}

/// SQLite engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// `PRAGMA synchronous` value: "off", "normal", "full" or "extra"
    #[serde(default = "default_synchronous")]
    pub synchronous: String,

    /// Maximum pooled connections per database file
    #[serde(default = "default_sqlite_max_connections")]
    pub max_connections: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            synchronous: default_synchronous(),
            max_connections: default_sqlite_max_connections(),
        }
    }
}

fn default_synchronous() -> String {
    "normal".to_string()
}

fn default_sqlite_max_connections() -> u32 {
    5
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
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

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations, or defaults if none exists
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./mailidx.toml"),
            PathBuf::from("/etc/mailidx/mailidx.toml"),
        ];

        for path in paths {
            if path.exists() {
                info!("Loading configuration from {}", path.display());
                return Self::from_file(&path);
            }
        }

        info!("No configuration file found, using defaults");
        Ok(Self::default())
    }
}
