//! Control messages
//!
//! Control messages announce intent only. File bytes always travel as a
//! separate stream frame.

use crate::codec::message_frame;
use peerstore_core::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A stream of `size` bytes for `key` in namespace `id` follows
    StoreFile { id: String, key: String, size: i64 },
    /// Ask peers holding `key` in namespace `id` to send it
    GetFile { id: String, key: String },
}

impl Message {
    /// Key the message refers to
    pub fn key(&self) -> &str {
        match self {
            Message::StoreFile { key, .. } | Message::GetFile { key, .. } => key,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Serialize into a complete inline frame, control byte included
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        message_frame(&self.to_bytes()?)
    }
}
