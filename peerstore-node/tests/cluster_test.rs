//! Cluster integration tests
//!
//! Starts real file servers on loopback and exercises replication:
//! store → broadcast → fetch back over the network.

use futures::future::join_all;
use peerstore_core::crypto::IV_SIZE;
use peerstore_core::{hash_key, EncryptionKey, Result};
use peerstore_network::{Message, INCOMING_STREAM};
use peerstore_node::{FileServer, FileServerOptions};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const SETTLE: Duration = Duration::from_millis(50);

struct TestNode {
    _temp_dir: TempDir,
    server: Arc<FileServer>,
    handle: JoinHandle<Result<()>>,
}

impl TestNode {
    async fn start(bootstrap: Vec<String>) -> Self {
        Self::start_with(bootstrap, |opts| opts).await
    }

    async fn start_with(
        bootstrap: Vec<String>,
        configure: impl FnOnce(FileServerOptions) -> FileServerOptions,
    ) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let opts = FileServerOptions::new("127.0.0.1:0", temp_dir.path())
            .with_bootstrap_nodes(bootstrap)
            .with_settle_delay(SETTLE);
        let server = FileServer::new(configure(opts));

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        // Wait for server to start
        sleep(Duration::from_millis(100)).await;

        TestNode {
            _temp_dir: temp_dir,
            server,
            handle,
        }
    }

    fn addr(&self) -> String {
        self.server.addr()
    }

    fn stop(&self) {
        self.server.stop();
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn wait_for_peers(nodes: &[(&TestNode, usize)]) {
    for (node, count) in nodes {
        let server = node.server.clone();
        let count = *count;
        assert!(
            eventually(|| {
                let server = server.clone();
                async move { server.peer_count() == count }
            })
            .await,
            "peer count never reached {}",
            count
        );
    }
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.unwrap();
    buf
}

async fn replica_bytes(node: &TestNode, owner: &str, key: &str) -> Vec<u8> {
    let (_, file) = node.server.store_handle().read(owner, key).await.unwrap();
    read_all(file).await
}

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Connect a bare TCP socket to `node` and wait until it is registered.
async fn raw_peer(node: &TestNode) -> TcpStream {
    let conn = TcpStream::connect(node.addr()).await.unwrap();
    wait_for_peers(&[(node, 1)]).await;
    conn
}

/// Write one frame and give the node time to consume it on its own.
async fn send_frame(conn: &mut TcpStream, frame: &[u8]) {
    conn.write_all(frame).await.unwrap();
    sleep(SETTLE).await;
}

fn announce(id: &str, key: &str, size: i64) -> Vec<u8> {
    Message::StoreFile {
        id: id.to_string(),
        key: key.to_string(),
        size,
    }
    .to_frame()
    .unwrap()
}

fn stream(bytes: &[u8]) -> Vec<u8> {
    let mut frame = vec![INCOMING_STREAM];
    frame.extend_from_slice(bytes);
    frame
}

#[tokio::test]
async fn test_single_node_roundtrip() {
    let node = TestNode::start(vec![]).await;

    let mut data: &[u8] = b"hello";
    node.server.store("greeting", &mut data).await.unwrap();
    assert!(node.server.store_handle().has(node.server.id(), "greeting").await);

    let (size, file) = node.server.get("greeting").await.unwrap();
    assert_eq!(size, 5);
    assert_eq!(read_all(file).await, b"hello");

    node.stop();
}

#[tokio::test]
async fn test_three_node_fanout() {
    let a = TestNode::start(vec![]).await;
    let b = TestNode::start(vec![a.addr()]).await;
    let c = TestNode::start(vec![a.addr()]).await;
    wait_for_peers(&[(&a, 2), (&b, 1), (&c, 1)]).await;

    let data = payload(100 * 1024);
    let mut src: &[u8] = &data;
    a.server.store("fanout", &mut src).await.unwrap();

    let owner = a.server.id().to_string();
    for replica in [&b, &c] {
        let server = replica.server.clone();
        let owner = owner.clone();
        assert!(
            eventually(|| {
                let server = server.clone();
                let owner = owner.clone();
                async move { server.store_handle().has(&owner, "fanout").await }
            })
            .await,
            "replica never arrived"
        );
        assert_eq!(replica_bytes(replica, &owner, "fanout").await, data);
    }

    for node in [&a, &b, &c] {
        node.stop();
    }
}

#[tokio::test]
async fn test_get_from_network_after_local_delete() {
    let a = TestNode::start(vec![]).await;
    let b = TestNode::start(vec![a.addr()]).await;
    wait_for_peers(&[(&a, 1), (&b, 1)]).await;

    let owner = a.server.id().to_string();
    for (i, size) in [0usize, 1, 100 * 1024].into_iter().enumerate() {
        let key = format!("network_{}", i);
        let data = payload(size);
        let mut src: &[u8] = &data;
        a.server.store(&key, &mut src).await.unwrap();

        let server = b.server.clone();
        let (owner_c, key_c) = (owner.clone(), key.clone());
        assert!(
            eventually(|| {
                let server = server.clone();
                let (owner, key) = (owner_c.clone(), key_c.clone());
                async move { server.store_handle().has(&owner, &key).await }
            })
            .await
        );

        a.server.delete(&key).await.unwrap();
        assert!(!a.server.store_handle().has(&owner, &key).await);

        let (fetched_size, file) = timeout(Duration::from_secs(5), a.server.get(&key))
            .await
            .expect("network get timed out")
            .unwrap();
        assert_eq!(fetched_size as usize, size);
        assert_eq!(read_all(file).await, data);
    }

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_encrypted_replication() {
    let key = EncryptionKey::generate();
    let k1 = key.clone();
    let k2 = key.clone();
    let a = TestNode::start_with(vec![], |o| o.with_encryption_key(k1)).await;
    let b = TestNode::start_with(vec![a.addr()], |o| o.with_encryption_key(k2)).await;
    wait_for_peers(&[(&a, 1), (&b, 1)]).await;

    let plaintext = b"a secret that only travels encrypted".to_vec();
    let mut src: &[u8] = &plaintext;
    a.server.store("secret", &mut src).await.unwrap();

    // The owner's copy stays plaintext, named by the key's hash.
    let owner = a.server.id().to_string();
    let object = hash_key("secret");
    assert_eq!(replica_bytes(&a, &owner, &object).await, plaintext);

    let server = b.server.clone();
    let (owner_c, object_c) = (owner.clone(), object.clone());
    assert!(
        eventually(|| {
            let server = server.clone();
            let (owner, object) = (owner_c.clone(), object_c.clone());
            async move { server.store_handle().has(&owner, &object).await }
        })
        .await
    );
    assert!(!b.server.store_handle().has(&owner, "secret").await);

    // The replica is IV + ciphertext.
    let replica = replica_bytes(&b, &owner, &object).await;
    assert_eq!(replica.len(), plaintext.len() + IV_SIZE);
    assert_ne!(&replica[IV_SIZE..], plaintext.as_slice());

    a.server.delete("secret").await.unwrap();
    let (size, file) = timeout(Duration::from_secs(5), a.server.get("secret"))
        .await
        .expect("network get timed out")
        .unwrap();
    assert_eq!(size as usize, plaintext.len());
    assert_eq!(read_all(file).await, plaintext);

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_concurrent_distinct_stores() {
    let a = TestNode::start(vec![]).await;
    let b = TestNode::start(vec![a.addr()]).await;
    wait_for_peers(&[(&a, 1), (&b, 1)]).await;

    let keys: Vec<String> = (0..8).map(|i| format!("concurrent_{}", i)).collect();
    let stores = keys.iter().map(|key| {
        let server = a.server.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let data = format!("contents of {}", key).into_bytes();
            let mut src: &[u8] = &data;
            server.store(&key, &mut src).await
        })
    });

    let results = timeout(Duration::from_secs(10), join_all(stores))
        .await
        .expect("concurrent stores deadlocked");
    for result in results {
        result.unwrap().unwrap();
    }

    let owner = a.server.id().to_string();
    for key in &keys {
        let expected = format!("contents of {}", key).into_bytes();
        let (_, file) = a.server.get(key).await.unwrap();
        assert_eq!(read_all(file).await, expected);

        let server = b.server.clone();
        let (owner_c, key_c) = (owner.clone(), key.clone());
        assert!(
            eventually(|| {
                let server = server.clone();
                let (owner, key) = (owner_c.clone(), key_c.clone());
                async move { server.store_handle().has(&owner, &key).await }
            })
            .await,
            "replica of {} never arrived",
            key
        );
        assert_eq!(replica_bytes(&b, &owner, key).await, expected);
    }

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_max_peers_rejects_extra_connections() {
    let a = TestNode::start_with(vec![], |o| o.with_max_peers(1)).await;
    let b = TestNode::start(vec![a.addr()]).await;
    wait_for_peers(&[(&a, 1), (&b, 1)]).await;

    let c = TestNode::start(vec![a.addr()]).await;
    // A closes the rejected connection and C drops A from its registry.
    wait_for_peers(&[(&c, 0)]).await;
    assert_eq!(a.server.peer_count(), 1);

    for node in [&a, &b, &c] {
        node.stop();
    }
}

#[tokio::test]
async fn test_short_stream_is_discarded() {
    let node = TestNode::start(vec![]).await;
    let mut conn = raw_peer(&node).await;

    send_frame(&mut conn, &announce("owner", "k", 100)).await;
    send_frame(&mut conn, &stream(&[7u8; 10])).await;
    conn.shutdown().await.unwrap();
    drop(conn);

    // The node gives the connection back to its read loop, which then sees EOF.
    wait_for_peers(&[(&node, 0)]).await;
    assert!(!node.server.store_handle().has("owner", "k").await);

    node.stop();
}

#[tokio::test]
async fn test_rejected_stream_keeps_connection_in_sync() {
    let node = TestNode::start(vec![]).await;
    let mut conn = raw_peer(&node).await;

    // ".." is not a valid namespace, so the store refuses the write.
    send_frame(&mut conn, &announce("..", "bad", 1)).await;
    send_frame(&mut conn, &stream(&[0x01])).await;

    send_frame(&mut conn, &announce("good", "g", 3)).await;
    send_frame(&mut conn, &stream(b"abc")).await;

    let server = node.server.clone();
    assert!(
        eventually(|| {
            let server = server.clone();
            async move { server.store_handle().has("good", "g").await }
        })
        .await,
        "frame after a rejected stream was lost"
    );
    assert_eq!(replica_bytes(&node, "good", "g").await, b"abc");
    assert_eq!(node.server.peer_count(), 1);

    node.stop();
}

#[tokio::test]
async fn test_stop_ends_start() {
    let node = TestNode::start(vec![]).await;
    node.stop();

    let TestNode { handle, .. } = node;
    let result = timeout(Duration::from_secs(2), handle)
        .await
        .expect("start did not return after stop")
        .unwrap();
    assert!(result.is_ok());
}
