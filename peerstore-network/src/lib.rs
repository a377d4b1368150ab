//! Peerstore Network Layer
//!
//! Plain TCP networking for peerstore nodes:
//! - **Codec**: one control byte splits inline control messages from raw streams
//! - **Message**: the `StoreFile` / `GetFile` control envelope
//! - **Peer**: a live connection with send, close and raw stream access
//! - **Transport**: listener, dialer, handshake and per-connection read loops
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                    TcpTransport                       │
//! │                                                       │
//! │  accept loop ──┐                                      │
//! │  dial ─────────┼─▶ handshake ─▶ on_peer ─▶ read loop  │
//! │                │                    (one per peer)    │
//! │                │                         │            │
//! │                │                         ▼            │
//! │                │              bounded Rpc channel     │
//! └────────────────│─────────────────────────│────────────┘
//!                  │                         ▼
//!                  │                 consume() (once)
//!                  │                         │
//!                  ▼                         ▼
//!            Remote nodes            protocol dispatcher
//! ```
//!
//! After a stream marker the read loop parks until the consumer calls
//! [`Peer::close_stream`], so stream bytes are read by the protocol layer
//! through [`Peer::open_stream`].

pub mod codec;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod transport;

// Re-exports
pub use codec::{
    Decoder, DefaultDecoder, Rpc, INCOMING_MESSAGE, INCOMING_STREAM, MAX_INLINE_PAYLOAD,
};
pub use handshake::{nop_handshake, HandshakeFn};
pub use message::Message;
pub use peer::{ExactReader, Peer, StreamReader, StreamWriter, TcpPeer};
pub use transport::{
    OnPeerDisconnectFn, OnPeerFn, TcpTransport, Transport, TransportOptions, DEFAULT_RPC_BUFFER,
};
