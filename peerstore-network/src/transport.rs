//! TCP transport
//!
//! Accepts and dials connections, runs the handshake and the peer hook,
//! then spawns one read loop per connection. Every read loop feeds the same
//! bounded RPC channel, handed out once through [`Transport::consume`].

use crate::codec::{Decoder, DefaultDecoder, Rpc};
use crate::handshake::{nop_handshake, HandshakeFn};
use crate::peer::{Peer, TcpPeer};
use parking_lot::Mutex;
use peerstore_core::error::{PeerStoreError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default capacity of the shared RPC channel
pub const DEFAULT_RPC_BUFFER: usize = 1024;

/// Called after a successful handshake; an error rejects the peer
pub type OnPeerFn = Arc<dyn Fn(Arc<dyn Peer>) -> Result<()> + Send + Sync>;

/// Called with the peer's remote address once its read loop has ended
pub type OnPeerDisconnectFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Moves bytes between this node and its peers
pub trait Transport: Send + Sync {
    /// Bound listen address, or the configured one before `listen_and_accept`
    fn addr(&self) -> String;

    /// Open an outbound connection and start its read loop
    fn dial<'a>(&'a self, addr: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Bind the listener and start accepting in the background
    fn listen_and_accept(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Take the inbound RPC channel. Returns `None` after the first call.
    fn consume(&self) -> Option<mpsc::Receiver<Rpc>>;

    /// Stop accepting. Established connections are left open.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Transport configuration
#[derive(Clone)]
pub struct TransportOptions {
    /// Address to listen on, e.g. `127.0.0.1:3000`
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub decoder: Arc<dyn Decoder>,
    pub on_peer: Option<OnPeerFn>,
    pub on_peer_disconnect: Option<OnPeerDisconnectFn>,
    /// Capacity of the shared RPC channel
    pub rpc_buffer: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            handshake: nop_handshake(),
            decoder: Arc::new(DefaultDecoder),
            on_peer: None,
            on_peer_disconnect: None,
            rpc_buffer: DEFAULT_RPC_BUFFER,
        }
    }
}

impl TransportOptions {
    /// Create options for the given listen address
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_handshake(mut self, handshake: HandshakeFn) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_on_peer(mut self, on_peer: OnPeerFn) -> Self {
        self.on_peer = Some(on_peer);
        self
    }

    pub fn with_on_peer_disconnect(mut self, cb: OnPeerDisconnectFn) -> Self {
        self.on_peer_disconnect = Some(cb);
        self
    }

    pub fn with_rpc_buffer(mut self, size: usize) -> Self {
        self.rpc_buffer = size;
        self
    }
}

impl std::fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOptions")
            .field("listen_addr", &self.listen_addr)
            .field("on_peer", &self.on_peer.is_some())
            .field("on_peer_disconnect", &self.on_peer_disconnect.is_some())
            .field("rpc_buffer", &self.rpc_buffer)
            .finish_non_exhaustive()
    }
}

/// State shared with the accept loop and every read loop
struct Shared {
    opts: TransportOptions,
    rpc_tx: mpsc::Sender<Rpc>,
}

/// TCP implementation of [`Transport`]
pub struct TcpTransport {
    shared: Arc<Shared>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(opts: TransportOptions) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.rpc_buffer.max(1));
        Self {
            shared: Arc::new(Shared { opts, rpc_tx }),
            rpc_rx: Mutex::new(Some(rpc_rx)),
            local_addr: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Address the listener is bound to, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Transport for TcpTransport {
    fn addr(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.shared.opts.listen_addr.clone(),
        }
    }

    fn dial<'a>(&'a self, addr: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let conn = TcpStream::connect(addr).await.map_err(|e| {
                PeerStoreError::Network(format!("failed to dial {}: {}", addr, e))
            })?;
            debug!(addr = %addr, "Dialed peer");
            tokio::spawn(handle_conn(self.shared.clone(), conn, true));
            Ok::<(), PeerStoreError>(())
        })
    }

    fn listen_and_accept(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let listener = TcpListener::bind(&self.shared.opts.listen_addr)
                .await
                .map_err(|e| {
                    PeerStoreError::Network(format!(
                        "failed to bind {}: {}",
                        self.shared.opts.listen_addr, e
                    ))
                })?;
            let local = listener.local_addr()?;
            *self.local_addr.lock() = Some(local);
            info!(addr = %local, "TCP transport listening");

            tokio::spawn(accept_loop(
                self.shared.clone(),
                listener,
                self.shutdown.clone(),
            ));
            Ok::<(), PeerStoreError>(())
        })
    }

    fn consume(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.rpc_rx.lock().take()
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.shutdown.cancel();
            Ok::<(), PeerStoreError>(())
        })
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("TCP listener closed");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, addr)) => {
                    debug!(addr = %addr, "Accepted connection");
                    tokio::spawn(handle_conn(shared.clone(), conn, false));
                }
                Err(e) => {
                    error!(error = %e, "TCP accept error");
                }
            }
        }
    }
}

async fn handle_conn(shared: Arc<Shared>, conn: TcpStream, outbound: bool) {
    let peer = match TcpPeer::new(conn, outbound) {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            warn!(error = %e, "Failed to set up connection");
            return;
        }
    };
    let remote = peer.remote_addr().to_string();

    if let Err(e) = (shared.opts.handshake)(&*peer as &dyn Peer) {
        warn!(peer = %remote, error = %e, "Handshake failed, dropping connection");
        let _ = peer.close().await;
        return;
    }

    if let Some(on_peer) = &shared.opts.on_peer {
        if let Err(e) = on_peer(peer.clone() as Arc<dyn Peer>) {
            warn!(peer = %remote, error = %e, "Peer rejected");
            let _ = peer.close().await;
            return;
        }
    }

    info!(peer = %remote, outbound = outbound, "Peer connected");

    read_loop(&shared, &peer).await;

    info!(peer = %remote, "Peer disconnected");
    if let Some(cb) = &shared.opts.on_peer_disconnect {
        cb(&remote);
    }
}

async fn read_loop(shared: &Shared, peer: &TcpPeer) {
    loop {
        let decoded = {
            let mut reader = peer.lock_reader().await;
            shared.opts.decoder.decode(&mut *reader).await
        };

        let mut rpc = match decoded {
            Ok(rpc) => rpc,
            Err(e) if e.is_disconnect() => {
                debug!(peer = %peer.remote_addr(), error = %e, "Read loop ending");
                return;
            }
            Err(e) => {
                warn!(peer = %peer.remote_addr(), error = %e, "Dropping malformed frame");
                continue;
            }
        };

        rpc.from = peer.remote_addr().to_string();
        let stream = rpc.stream;

        if shared.rpc_tx.send(rpc).await.is_err() {
            debug!(peer = %peer.remote_addr(), "RPC consumer gone, stopping read loop");
            return;
        }

        if stream {
            debug!(peer = %peer.remote_addr(), "Incoming stream, waiting for release");
            peer.wait_stream_closed().await;
            debug!(peer = %peer.remote_addr(), "Stream closed, resuming read loop");
        }
    }
}
