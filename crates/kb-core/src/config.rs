//! Configuration types for the knowledge-base service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{KbError, Result};

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KbConfig {
    /// Backing store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Embedding configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Network server configuration.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Where documents and embeddings live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// SQLite in memory; data is lost on exit.
    InMemory,
    /// SQLite file under `data_dir`.
    OnDisk,
    /// Chroma-compatible REST server at `host:port`.
    Remote,
}

impl fmt::Display for StoreMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InMemory => "in-memory",
            Self::OnDisk => "on-disk",
            Self::Remote => "remote",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for StoreMode {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "in-memory" | "memory" | "ephemeral" => Ok(Self::InMemory),
            "on-disk" | "disk" | "persistent" => Ok(Self::OnDisk),
            "remote" | "http" => Ok(Self::Remote),
            other => Err(KbError::config(format!(
                "unsupported store mode '{}' (expected in-memory, on-disk or remote)",
                other
            ))),
        }
    }
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store mode.
    #[serde(default = "default_store_mode")]
    pub mode: StoreMode,

    /// Directory holding the on-disk database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remote engine host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Remote engine port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-operation timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Enable WAL mode for the on-disk database.
    #[serde(default = "default_true")]
    pub wal_mode: bool,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: default_store_mode(),
            data_dir: default_data_dir(),
            host: default_host(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

impl StoreConfig {
    /// Path of the SQLite database file for on-disk mode.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("kb.sqlite3")
    }

    /// Base URL of the remote engine.
    pub fn remote_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Embedding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding vector width.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
        }
    }
}

/// Network server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the RPC endpoint binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Maximum number of requests processed at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_concurrency: default_max_concurrency(),
            request_timeout_ms: default_timeout_ms(),
        }
    }
}

// Default value functions

fn default_true() -> bool {
    true
}

fn default_store_mode() -> StoreMode {
    StoreMode::OnDisk
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_busy_timeout() -> u32 {
    30000
}

fn default_dimension() -> usize {
    1024
}

fn default_bind_address() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_max_concurrency() -> usize {
    64
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kb-mcp")
}

impl KbConfig {
    /// Load configuration from file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KbError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| KbError::config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load configuration from default paths.
    pub fn load_default() -> Result<Self> {
        // Try user config first
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("kb-mcp").join("config.toml");
            if user_config.exists() {
                return Self::load(&user_config);
            }
        }

        // Try local config
        let local_config = PathBuf::from("kb-mcp.toml");
        if local_config.exists() {
            return Self::load(&local_config);
        }

        Ok(Self::default())
    }

    /// Apply `KB_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("KB_STORE_MODE") {
            self.store.mode = mode.parse()?;
        }
        if let Some(host) = lookup("KB_STORE_HOST") {
            self.store.host = host;
        }
        if let Some(port) = lookup("KB_STORE_PORT") {
            self.store.port = port
                .parse()
                .map_err(|_| KbError::config(format!("KB_STORE_PORT is not a port: {}", port)))?;
        }
        if let Some(dir) = lookup("KB_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("KB_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }
        Ok(())
    }
}
