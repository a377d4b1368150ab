//! Peerstore Core Library
//!
//! Core abstractions shared by every peerstore crate.
//! This crate provides:
//! - AES counter-mode stream transforms for payloads at rest and in transit
//! - Random node identifiers and encryption keys
//! - Key hashing for keys that must not travel in clear
//! - Common error handling

pub mod crypto;
pub mod error;

pub use crypto::{copy_decrypt, copy_encrypt, generate_id, hash_key, EncryptionKey};
pub use error::{PeerStoreError, Result};

/// Buffer size used when copying streams through a cipher (32 KiB).
pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Default folder name for the store root when none is configured.
pub const DEFAULT_ROOT_FOLDER: &str = "peerstore";
