//! Configuration management for a peerstore node
//!
//! Supports loading from TOML files, environment variables and CLI flags.
//! Precedence: CLI > environment > file > defaults.

use crate::server::FileServerOptions;
use peerstore_core::crypto::KEY_SIZE;
use peerstore_core::EncryptionKey;
use peerstore_storage::PathTransformKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity
    #[serde(default)]
    pub node: NodeIdentity,

    /// Local store settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Transport and replication settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Payload encryption
    #[serde(default)]
    pub crypto: CryptoSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen address cannot be empty".to_string(),
            ));
        }

        if self.network.rpc_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "rpc_buffer must be at least 1".to_string(),
            ));
        }

        self.storage.transform_kind()?;
        self.crypto.key()?;

        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(
        mut self,
        listen_addr: Option<String>,
        bootstrap_peers: Vec<String>,
        root: Option<PathBuf>,
    ) -> Self {
        if let Some(addr) = listen_addr {
            self.network.listen_addr = addr;
        }
        if !bootstrap_peers.is_empty() {
            self.network.bootstrap_peers = bootstrap_peers;
        }
        if let Some(root) = root {
            self.storage.root = root;
        }
        self
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("PEERSTORE_LISTEN_ADDR") {
            self.network.listen_addr = addr;
        }

        // Comma-separated list of addresses
        if let Ok(peers) = std::env::var("PEERSTORE_BOOTSTRAP") {
            self.network.bootstrap_peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(root) = std::env::var("PEERSTORE_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }

        if let Ok(id) = std::env::var("PEERSTORE_NODE_ID") {
            self.node.id = Some(id);
        }

        if let Ok(key) = std::env::var("PEERSTORE_ENCRYPTION_KEY") {
            self.crypto.encryption_key = Some(key);
        }

        self
    }

    /// Build the options consumed by [`crate::FileServer`]
    pub fn to_server_options(&self) -> Result<FileServerOptions, ConfigError> {
        let mut opts = FileServerOptions::new(&self.network.listen_addr, &self.storage.root)
            .with_bootstrap_nodes(self.network.bootstrap_peers.clone())
            .with_path_transform(self.storage.transform_kind()?.transform())
            .with_settle_delay(Duration::from_millis(self.network.settle_delay_ms));
        opts.rpc_buffer = self.network.rpc_buffer;

        if let Some(id) = &self.node.id {
            opts = opts.with_id(id.clone());
        }
        if self.network.max_peers > 0 {
            opts = opts.with_max_peers(self.network.max_peers);
        }
        if let Some(key) = self.crypto.key()? {
            opts = opts.with_encryption_key(key);
        }
        Ok(opts)
    }
}

/// Node identity configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Namespace id (random per start if not provided)
    #[serde(default)]
    pub id: Option<String>,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory of the store
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Key to path mapping: "cas" or "identity"
    #[serde(default = "default_path_transform")]
    pub path_transform: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            path_transform: default_path_transform(),
        }
    }
}

impl StorageSettings {
    pub fn transform_kind(&self) -> Result<PathTransformKind, ConfigError> {
        self.path_transform
            .parse()
            .map_err(ConfigError::ValidationError)
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(peerstore_core::DEFAULT_ROOT_FOLDER)
}

fn default_path_transform() -> String {
    PathTransformKind::Cas.to_string()
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Peers dialed at startup
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,

    /// Maximum registered peers (0 = unlimited)
    #[serde(default)]
    pub max_peers: usize,

    /// Capacity of the inbound RPC channel
    #[serde(default = "default_rpc_buffer")]
    pub rpc_buffer: usize,

    /// Pause between an announcement and its stream, in milliseconds
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_peers: Vec::new(),
            max_peers: 0,
            rpc_buffer: default_rpc_buffer(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_rpc_buffer() -> usize {
    peerstore_network::DEFAULT_RPC_BUFFER
}

fn default_settle_delay_ms() -> u64 {
    5
}

/// Encryption configuration
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct CryptoSettings {
    /// Hex-encoded 32-byte key; replication is plaintext when unset
    #[serde(default, skip_serializing)]
    pub encryption_key: Option<String>,
}

impl CryptoSettings {
    /// Parse the configured key
    pub fn key(&self) -> Result<Option<EncryptionKey>, ConfigError> {
        let Some(hex) = &self.encryption_key else {
            return Ok(None);
        };
        let key = EncryptionKey::from_hex(hex)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if key.as_bytes().len() != KEY_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                key.as_bytes().len()
            )));
        }
        Ok(Some(key))
    }
}

impl std::fmt::Debug for CryptoSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSettings")
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
