//! Wire framing
//!
//! Every frame starts with one control byte:
//!
//! ```text
//! 0x1 <inline payload, at most MAX_INLINE_PAYLOAD bytes, one read>
//! 0x2 <raw bytes, length known from a prior StoreFile announcement>
//! ```
//!
//! The decoder never consumes stream bytes; the protocol layer reads them
//! straight off the connection.

use bytes::Bytes;
use peerstore_core::error::{PeerStoreError, Result};
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Control byte for an inline control message
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Control byte announcing a raw byte stream
pub const INCOMING_STREAM: u8 = 0x2;

/// Upper bound of a single inline read. Longer messages are truncated.
pub const MAX_INLINE_PAYLOAD: usize = 1024;

/// One decoded inbound frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rpc {
    /// Remote address of the connection the frame arrived on
    pub from: String,
    /// Inline payload; empty for stream frames
    pub payload: Bytes,
    /// True when the frame is a stream marker
    pub stream: bool,
}

/// Reader type handed to decoders
pub type FrameReader<'a> = dyn AsyncRead + Send + Unpin + 'a;

/// Turns connection bytes into [`Rpc`] frames
pub trait Decoder: Send + Sync {
    /// Decode exactly one frame. `from` is left empty for the caller to stamp.
    fn decode<'a>(
        &'a self,
        reader: &'a mut FrameReader<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<Rpc>> + Send + 'a>>;
}

/// The control-byte decoder used by the TCP transport
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDecoder;

impl Decoder for DefaultDecoder {
    fn decode<'a>(
        &'a self,
        reader: &'a mut FrameReader<'_>,
    ) -> Pin<Box<dyn Future<Output = Result<Rpc>> + Send + 'a>> {
        Box::pin(async move {
            let control = reader.read_u8().await?;
            match control {
                INCOMING_STREAM => Ok(Rpc {
                    stream: true,
                    ..Default::default()
                }),
                INCOMING_MESSAGE => {
                    let mut buf = vec![0u8; MAX_INLINE_PAYLOAD];
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        return Err(PeerStoreError::ConnectionClosed);
                    }
                    buf.truncate(n);
                    Ok(Rpc {
                        payload: Bytes::from(buf),
                        ..Default::default()
                    })
                }
                other => Err(PeerStoreError::UnknownControlByte(other)),
            }
        })
    }
}

/// Build an inline frame: control byte followed by the payload
pub fn message_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() > MAX_INLINE_PAYLOAD {
        return Err(PeerStoreError::Network(format!(
            "inline payload must be 1..={} bytes, got {}",
            MAX_INLINE_PAYLOAD,
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(INCOMING_MESSAGE);
    frame.extend_from_slice(payload);
    Ok(frame)
}
