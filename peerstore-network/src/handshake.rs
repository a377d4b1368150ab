//! Connection handshake
//!
//! A handshake runs once per new connection before it is admitted.
//! Returning an error drops the connection.

use crate::peer::Peer;
use peerstore_core::error::Result;
use std::sync::Arc;

/// Pluggable handshake function
pub type HandshakeFn = Arc<dyn Fn(&dyn Peer) -> Result<()> + Send + Sync>;

/// Handshake that admits every connection
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(|_peer: &dyn Peer| Ok(()))
}
