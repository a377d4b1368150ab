//! Error types for peerstore
//!
//! Provides a unified error type for all peerstore operations.

use thiserror::Error;

/// Result type alias for peerstore operations
pub type Result<T> = std::result::Result<T, PeerStoreError>;

/// Unified error type for peerstore
#[derive(Error, Debug)]
pub enum PeerStoreError {
    // ===== Cryptography Errors =====
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected one of {expected:?}, got {actual}")]
    InvalidKeyLength {
        expected: &'static [usize],
        actual: usize,
    },

    // ===== Storage Errors =====
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Network Errors =====
    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Unknown control byte: {0:#04x}")]
    UnknownControlByte(u8),

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Peer rejected: {0}")]
    PeerRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PeerStoreError {
    /// True when the error means the remote end went away, as opposed to
    /// a single bad frame on a live connection.
    pub fn is_disconnect(&self) -> bool {
        match self {
            PeerStoreError::ConnectionClosed => true,
            PeerStoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for PeerStoreError {
    fn from(err: bincode::Error) -> Self {
        PeerStoreError::Serialization(err.to_string())
    }
}
