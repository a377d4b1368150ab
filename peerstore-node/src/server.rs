//! File server: the replication protocol
//!
//! `store` writes locally, announces the object to every peer with a
//! `StoreFile` control message, waits the settle delay and then pushes the
//! bytes as a stream frame. `get` serves from the local store or asks every
//! peer with `GetFile` and waits for one of them to push the object back.
//!
//! A single dispatch task drains the transport's RPC channel. It only reads
//! from connections; all outbound work runs under one outbound lock so the
//! control-then-stream pair of one operation never interleaves with another.

use futures::future::join_all;
use parking_lot::Mutex;
use peerstore_core::crypto::{copy_encrypt, IV_SIZE};
use peerstore_core::error::{PeerStoreError, Result};
use peerstore_core::{hash_key, EncryptionKey};
use peerstore_network::{
    nop_handshake, ExactReader, HandshakeFn, Message, OnPeerDisconnectFn, OnPeerFn, Peer, Rpc,
    TcpTransport, Transport, TransportOptions, DEFAULT_RPC_BUFFER, INCOMING_STREAM,
};
use std::borrow::Cow;
use peerstore_storage::{cas_path_transform, PathTransform, Store, StoreConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default pause between a `StoreFile` announcement and its stream
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(5);

/// File server configuration
#[derive(Clone)]
pub struct FileServerOptions {
    /// Address to listen on
    pub listen_addr: String,
    /// Peers dialed on start
    pub bootstrap_nodes: Vec<String>,
    /// Store root directory
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Namespace of this node; random when `None`
    pub id: Option<String>,
    /// Encrypts replicated streams when set
    pub encryption_key: Option<EncryptionKey>,
    pub handshake: HandshakeFn,
    /// Extra acceptance hook run before a peer is registered
    pub on_peer: Option<OnPeerFn>,
    /// Registry capacity; `None` is unlimited
    pub max_peers: Option<usize>,
    pub rpc_buffer: usize,
    pub settle_delay: Duration,
}

impl Default for FileServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            bootstrap_nodes: Vec::new(),
            storage_root: PathBuf::from(peerstore_core::DEFAULT_ROOT_FOLDER),
            path_transform: Arc::new(cas_path_transform),
            id: None,
            encryption_key: None,
            handshake: nop_handshake(),
            on_peer: None,
            max_peers: None,
            rpc_buffer: DEFAULT_RPC_BUFFER,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl FileServerOptions {
    /// Create options listening on `listen_addr` and storing under `storage_root`
    pub fn new(listen_addr: impl Into<String>, storage_root: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            storage_root: storage_root.into(),
            ..Default::default()
        }
    }

    pub fn with_bootstrap_nodes(mut self, nodes: Vec<String>) -> Self {
        self.bootstrap_nodes = nodes;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn with_path_transform(mut self, transform: PathTransform) -> Self {
        self.path_transform = transform;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeFn) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_on_peer(mut self, on_peer: OnPeerFn) -> Self {
        self.on_peer = Some(on_peer);
        self
    }

    pub fn with_max_peers(mut self, max: usize) -> Self {
        self.max_peers = Some(max);
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

impl std::fmt::Debug for FileServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServerOptions")
            .field("listen_addr", &self.listen_addr)
            .field("bootstrap_nodes", &self.bootstrap_nodes)
            .field("storage_root", &self.storage_root)
            .field("id", &self.id)
            .field("encrypted", &self.encryption_key.is_some())
            .field("max_peers", &self.max_peers)
            .field("rpc_buffer", &self.rpc_buffer)
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

/// A stream announced by a peer and not yet received
#[derive(Debug, Clone)]
struct Announcement {
    id: String,
    key: String,
    size: u64,
}

type FetchKey = (String, String);
type FetchMap = Mutex<HashMap<FetchKey, Vec<oneshot::Sender<()>>>>;

/// Interest of one network `get` in an object. Dropping it withdraws the
/// waiter, so abandoned or failed fetches do not linger in the map.
struct PendingFetch<'a> {
    fetches: &'a FetchMap,
    key: FetchKey,
    rx: oneshot::Receiver<()>,
}

impl<'a> PendingFetch<'a> {
    fn register(fetches: &'a FetchMap, key: FetchKey) -> Self {
        let (tx, rx) = oneshot::channel();
        fetches.lock().entry(key.clone()).or_default().push(tx);
        Self { fetches, key, rx }
    }

    async fn arrived(&mut self) -> Result<()> {
        (&mut self.rx).await.map_err(|_| {
            PeerStoreError::Internal(format!("fetch of {} abandoned", self.key.1))
        })
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        self.rx.close();
        let mut fetches = self.fetches.lock();
        if let Some(waiters) = fetches.get_mut(&self.key) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                fetches.remove(&self.key);
            }
        }
    }
}

/// The replication server
pub struct FileServer {
    store: Store,
    transport: Arc<dyn Transport>,
    bootstrap_nodes: Vec<String>,
    encryption_key: Option<EncryptionKey>,
    user_on_peer: Option<OnPeerFn>,
    max_peers: Option<usize>,
    settle_delay: Duration,

    /// Registry of connected peers keyed by remote address
    peers: Mutex<HashMap<String, Arc<dyn Peer>>>,
    /// Per-peer `StoreFile` waiting for its stream
    announced: Mutex<HashMap<String, Announcement>>,
    /// Pending network `get` calls
    fetches: FetchMap,
    outbound: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    this: Weak<FileServer>,
}

impl FileServer {
    /// Build a server and its TCP transport. Nothing is bound until `start`.
    pub fn new(opts: FileServerOptions) -> Arc<Self> {
        let mut store_config =
            StoreConfig::new(&opts.storage_root).with_path_transform(opts.path_transform.clone());
        if let Some(id) = &opts.id {
            store_config = store_config.with_id(id.clone());
        }
        let store = Store::new(store_config);

        Arc::new_cyclic(|weak: &Weak<FileServer>| {
            let on_peer: OnPeerFn = {
                let weak = weak.clone();
                Arc::new(move |peer: Arc<dyn Peer>| match weak.upgrade() {
                    Some(server) => server.on_peer(peer),
                    None => Err(PeerStoreError::PeerRejected("server dropped".to_string())),
                })
            };
            let on_peer_disconnect: OnPeerDisconnectFn = {
                let weak = weak.clone();
                Arc::new(move |addr: &str| {
                    if let Some(server) = weak.upgrade() {
                        server.remove_peer(addr);
                    }
                })
            };

            let transport_opts = TransportOptions::new(opts.listen_addr.clone())
                .with_handshake(opts.handshake.clone())
                .with_on_peer(on_peer)
                .with_on_peer_disconnect(on_peer_disconnect)
                .with_rpc_buffer(opts.rpc_buffer);

            Self {
                store,
                transport: Arc::new(TcpTransport::new(transport_opts)),
                bootstrap_nodes: opts.bootstrap_nodes,
                encryption_key: opts.encryption_key,
                user_on_peer: opts.on_peer,
                max_peers: opts.max_peers,
                settle_delay: opts.settle_delay,
                peers: Mutex::new(HashMap::new()),
                announced: Mutex::new(HashMap::new()),
                fetches: Mutex::new(HashMap::new()),
                outbound: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                this: weak.clone(),
            }
        })
    }

    /// Namespace of this node
    pub fn id(&self) -> &str {
        self.store.id()
    }

    /// Listen address, the bound one once started
    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    /// The local store
    pub fn store_handle(&self) -> &Store {
        &self.store
    }

    /// Name under which `key` is stored and announced. With encryption on,
    /// this is the key's hash so peers never learn the logical key.
    pub fn object_key<'a>(&self, key: &'a str) -> Cow<'a, str> {
        match self.encryption_key {
            Some(_) => Cow::Owned(hash_key(key)),
            None => Cow::Borrowed(key),
        }
    }

    /// Remote addresses of registered peers
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Register a peer admitted by the transport
    pub fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<()> {
        if let Some(hook) = &self.user_on_peer {
            hook(peer.clone())?;
        }

        let mut peers = self.peers.lock();
        if let Some(max) = self.max_peers {
            if peers.len() >= max && !peers.contains_key(peer.remote_addr()) {
                return Err(PeerStoreError::PeerRejected(format!(
                    "peer limit of {} reached",
                    max
                )));
            }
        }
        info!(peer = %peer.remote_addr(), outbound = peer.is_outbound(), "Registered peer");
        peers.insert(peer.remote_addr().to_string(), peer);
        Ok(())
    }

    fn remove_peer(&self, addr: &str) {
        if self.peers.lock().remove(addr).is_some() {
            info!(peer = %addr, "Removed peer");
        }
        self.announced.lock().remove(addr);
    }

    fn peer(&self, addr: &str) -> Option<Arc<dyn Peer>> {
        self.peers.lock().get(addr).cloned()
    }

    fn peer_snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Dial every bootstrap address. Failures are logged, not returned.
    pub async fn bootstrap_network(&self) {
        let dials = self
            .bootstrap_nodes
            .iter()
            .filter(|addr| !addr.is_empty())
            .map(|addr| async move {
                info!(addr = %addr, "Dialing bootstrap node");
                if let Err(e) = self.transport.dial(addr).await {
                    warn!(addr = %addr, error = %e, "Bootstrap dial failed");
                }
            });
        join_all(dials).await;
    }

    /// Listen, bootstrap, then run the dispatch loop until `stop`.
    pub async fn start(&self) -> Result<()> {
        self.transport.listen_and_accept().await?;
        let mut rpcs = self
            .transport
            .consume()
            .ok_or_else(|| PeerStoreError::Internal("file server already started".to_string()))?;
        info!(id = %self.id(), addr = %self.addr(), "File server started");

        self.bootstrap_network().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Stop requested");
                    break;
                }
                rpc = rpcs.recv() => match rpc {
                    Some(rpc) => {
                        if let Err(e) = self.handle_rpc(rpc).await {
                            warn!(error = %e, "Failed to handle RPC");
                        }
                    }
                    None => {
                        error!("Transport channel closed");
                        break;
                    }
                }
            }
        }

        self.transport.close().await?;
        info!(id = %self.id(), "File server stopped");
        Ok(())
    }

    /// Signal the dispatch loop to exit
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Store `reader` under `key` locally and replicate it to every peer.
    /// Returns the number of bytes written locally.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let id = self.id().to_string();
        let object = self.object_key(key);
        let size = self.store.write(&id, &object, reader).await?;
        info!(key = %key, bytes = size, "Stored file locally");

        let _outbound = self.outbound.lock().await;
        let peers = self.peer_snapshot();
        if peers.is_empty() {
            return Ok(size);
        }

        let wire_size = match self.encryption_key {
            Some(_) => size + IV_SIZE as u64,
            None => size,
        };
        let frame = Message::StoreFile {
            id: id.clone(),
            key: object.to_string(),
            size: wire_size as i64,
        }
        .to_frame()?;
        for peer in &peers {
            peer.send(&frame).await?;
        }

        tokio::time::sleep(self.settle_delay).await;

        for peer in &peers {
            let (_, mut file) = self.store.read(&id, &object).await?;
            let sent = self
                .push_stream(peer.as_ref(), &mut file, self.encryption_key.as_ref())
                .await?;
            debug!(peer = %peer.remote_addr(), key = %key, bytes = sent, "Replicated file");
        }

        info!(key = %key, peers = peers.len(), "Broadcast file to peers");
        Ok(size)
    }

    /// Open `key` from the local store, fetching it from peers if absent.
    ///
    /// A node with no peers returns `NotFound` for a missing key. Otherwise
    /// this waits, with no timeout, until some peer pushes the object back.
    pub async fn get(&self, key: &str) -> Result<(u64, File)> {
        let id = self.id().to_string();
        let object = self.object_key(key);
        if self.store.has(&id, &object).await {
            info!(key = %key, "Serving file from local disk");
            return self.store.read(&id, &object).await;
        }

        if self.peer_count() == 0 {
            return Err(PeerStoreError::NotFound(key.to_string()));
        }

        info!(key = %key, "File not found locally, fetching from network");
        let mut pending = PendingFetch::register(&self.fetches, (id.clone(), object.to_string()));

        if self.store.has(&id, &object).await {
            return self.store.read(&id, &object).await;
        }

        {
            let _outbound = self.outbound.lock().await;
            self.broadcast(&Message::GetFile {
                id: id.clone(),
                key: object.to_string(),
            })
            .await?;
        }

        pending.arrived().await?;
        info!(key = %key, "Received file from network");
        self.store.read(&id, &object).await
    }

    /// Delete `key` from this node's own namespace (bucket-level)
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.store.delete(self.id(), &self.object_key(key)).await
    }

    async fn broadcast(&self, msg: &Message) -> Result<()> {
        let frame = msg.to_frame()?;
        for peer in self.peer_snapshot() {
            peer.send(&frame).await?;
        }
        Ok(())
    }

    /// Write the stream marker and the bytes of `src`, encrypting when a key is given.
    async fn push_stream(
        &self,
        peer: &dyn Peer,
        src: &mut File,
        key: Option<&EncryptionKey>,
    ) -> Result<u64> {
        let mut writer = peer.stream_writer().await;
        writer.write_all(&[INCOMING_STREAM]).await?;
        let sent = match key {
            Some(key) => copy_encrypt(key, src, &mut writer).await?,
            None => tokio::io::copy(src, &mut writer).await?,
        };
        writer.flush().await?;
        Ok(sent)
    }

    async fn handle_rpc(&self, rpc: Rpc) -> Result<()> {
        if rpc.stream {
            return self.handle_stream(&rpc.from).await;
        }
        let msg = Message::from_bytes(&rpc.payload)?;
        self.handle_message(&rpc.from, msg).await
    }

    /// Dispatch one decoded control message from `from`
    pub async fn handle_message(&self, from: &str, msg: Message) -> Result<()> {
        match msg {
            Message::StoreFile { id, key, size } => self.handle_store_file(from, id, key, size),
            Message::GetFile { id, key } => self.handle_get_file(from, id, key),
        }
    }

    fn handle_store_file(&self, from: &str, id: String, key: String, size: i64) -> Result<()> {
        if self.peer(from).is_none() {
            return Err(PeerStoreError::PeerNotFound(from.to_string()));
        }
        let size = u64::try_from(size)
            .map_err(|_| PeerStoreError::Network(format!("negative size {} for {}", size, key)))?;

        debug!(peer = %from, key = %key, bytes = size, "Stream announced");
        let previous = self
            .announced
            .lock()
            .insert(from.to_string(), Announcement { id, key, size });
        if let Some(previous) = previous {
            warn!(peer = %from, key = %previous.key, "Announcement replaced before its stream arrived");
        }
        Ok(())
    }

    fn handle_get_file(&self, from: &str, id: String, key: String) -> Result<()> {
        let peer = self
            .peer(from)
            .ok_or_else(|| PeerStoreError::PeerNotFound(from.to_string()))?;
        let server = self
            .this
            .upgrade()
            .ok_or_else(|| PeerStoreError::Internal("file server dropped".to_string()))?;

        // Responses write to sockets, so they leave the dispatch task.
        tokio::spawn(async move {
            if let Err(e) = server.serve_file(peer.as_ref(), &id, &key).await {
                error!(peer = %peer.remote_addr(), key = %key, error = %e, "Failed to serve file");
            }
        });
        Ok(())
    }

    /// Announce and push a locally held object back to a requesting peer.
    /// Stored bytes go out as they are on disk.
    async fn serve_file(&self, peer: &dyn Peer, id: &str, key: &str) -> Result<()> {
        if !self.store.has(id, key).await {
            warn!(peer = %peer.remote_addr(), key = %key, "Requested file not held locally");
            return Ok(());
        }

        let _outbound = self.outbound.lock().await;
        let (size, mut file) = self.store.read(id, key).await?;
        let frame = Message::StoreFile {
            id: id.to_string(),
            key: key.to_string(),
            size: size as i64,
        }
        .to_frame()?;
        peer.send(&frame).await?;

        tokio::time::sleep(self.settle_delay).await;

        let sent = self.push_stream(peer, &mut file, None).await?;
        info!(peer = %peer.remote_addr(), key = %key, bytes = sent, "Served file to peer");
        Ok(())
    }

    async fn handle_stream(&self, from: &str) -> Result<()> {
        let peer = self
            .peer(from)
            .ok_or_else(|| PeerStoreError::PeerNotFound(from.to_string()))?;

        let announcement = self.announced.lock().remove(from);
        let result = match announcement {
            Some(announcement) => self.receive_stream(peer.as_ref(), &announcement).await,
            None => {
                warn!(peer = %from, "Stream without announcement, releasing connection");
                Ok(())
            }
        };
        peer.close_stream();
        result
    }

    /// Persist exactly `ann.size` announced bytes. A short stream or a failed
    /// write commits nothing, and the rest of the payload is drained so the
    /// read loop resumes on a frame boundary.
    async fn receive_stream(&self, peer: &dyn Peer, ann: &Announcement) -> Result<()> {
        let mut reader = ExactReader::new(peer.open_stream().await, ann.size);

        // Only this node's own namespace comes back through a fetch; replicas
        // held for other owners stay as received.
        let result = match &self.encryption_key {
            Some(enc_key) if ann.id == self.id() => {
                self.store
                    .write_decrypt(enc_key, &ann.id, &ann.key, &mut reader)
                    .await
            }
            _ => self.store.write(&ann.id, &ann.key, &mut reader).await,
        };

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let missing = reader.remaining();
                if missing > 0 {
                    match reader.drain().await {
                        Ok(n) => debug!(peer = %peer.remote_addr(), bytes = n, "Drained rejected stream"),
                        Err(drain_err) => {
                            warn!(peer = %peer.remote_addr(), missing = missing, error = %drain_err, "Failed to drain stream")
                        }
                    }
                }
                return Err(e);
            }
        };
        drop(reader);

        info!(peer = %peer.remote_addr(), key = %ann.key, bytes = written, "Received file");

        let waiters = self
            .fetches
            .lock()
            .remove(&(ann.id.clone(), ann.key.clone()));
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(());
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("id", &self.id())
            .field("addr", &self.addr())
            .field("peers", &self.peer_count())
            .finish_non_exhaustive()
    }
}
