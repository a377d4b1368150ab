//! Peerstore Node Library
//!
//! Provides the components for running a replicating storage node:
//! - `FileServer`, the store/get replication protocol over the TCP transport
//! - Configuration management (TOML, environment, CLI overrides)

pub mod config;
pub mod server;

pub use config::{
    ConfigError, CryptoSettings, NetworkSettings, NodeConfig, NodeIdentity, StorageSettings,
};
pub use server::{FileServer, FileServerOptions, DEFAULT_SETTLE_DELAY};
