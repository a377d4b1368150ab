//! Namespaced on-disk object store
//!
//! Objects are stored at `<root>/<namespace>/<PathKey>`. An empty namespace
//! is omitted from the path. Writes land in a temp file next to the target
//! and are renamed into place once complete.

use crate::path::{PathKey, PathTransform};
use crate::StoreConfig;
use peerstore_core::crypto::copy_decrypt;
use peerstore_core::error::{PeerStoreError, Result};
use peerstore_core::{generate_id, EncryptionKey};
use rand::Rng;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Local content-addressable store
pub struct Store {
    root: PathBuf,
    id: String,
    path_transform: PathTransform,
}

impl Store {
    /// Create a store from config. Nothing touches the disk until the first write.
    pub fn new(config: StoreConfig) -> Self {
        let id = config.id.unwrap_or_else(generate_id);
        info!(root = %config.root.display(), id = %id, "Opening store");
        Self {
            root: config.root,
            id,
            path_transform: config.path_transform,
        }
    }

    /// Namespace of the owning node
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Apply the path transform to a key
    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        if namespace.is_empty() {
            return Ok(self.root.clone());
        }
        check_component(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn object_path(&self, namespace: &str, key: &str) -> Result<(PathKey, PathBuf)> {
        let path_key = self.path_key(key);
        if path_key.segments.is_empty() {
            return Err(PeerStoreError::Storage(format!(
                "key {:?} maps to no directory",
                key
            )));
        }
        for segment in &path_key.segments {
            check_component(segment)?;
        }
        check_component(&path_key.filename)?;

        let path = self.namespace_dir(namespace)?.join(path_key.full_path());
        Ok((path_key, path))
    }

    /// Whether an object exists for `key` in `namespace`
    pub async fn has(&self, namespace: &str, key: &str) -> bool {
        match self.object_path(namespace, key) {
            Ok((_, path)) => fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Copy `reader` to the object for `key`, returning the bytes written
    pub async fn write<R>(&self, namespace: &str, key: &str, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (_, path) = self.object_path(namespace, key)?;
        let (tmp_path, mut file) = self.create_temp(&path).await?;

        let copied = match tokio::io::copy(reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                discard_temp(&tmp_path).await;
                return Err(e.into());
            }
        };

        self.commit(file, &tmp_path, &path).await?;
        debug!(namespace = %namespace, key = %key, bytes = copied, "Wrote object");
        Ok(copied)
    }

    /// Like [`Store::write`], but decrypts `reader` on the way in.
    /// Returns the plaintext byte count.
    pub async fn write_decrypt<R>(
        &self,
        enc_key: &EncryptionKey,
        namespace: &str,
        key: &str,
        reader: &mut R,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (_, path) = self.object_path(namespace, key)?;
        let (tmp_path, mut file) = self.create_temp(&path).await?;

        let written = match copy_decrypt(enc_key, reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                drop(file);
                discard_temp(&tmp_path).await;
                return Err(e);
            }
        };

        self.commit(file, &tmp_path, &path).await?;
        debug!(namespace = %namespace, key = %key, bytes = written, "Wrote decrypted object");
        Ok(written)
    }

    /// Open the object for `key`, returning its size and a read handle
    pub async fn read(&self, namespace: &str, key: &str) -> Result<(u64, File)> {
        let (_, path) = self.object_path(namespace, key)?;
        let file = File::open(&path).await.map_err(|e| not_found_or(e, key))?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Remove the whole bucket holding `key`: the directory named by the
    /// first path segment, including any sibling keys under it.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let (path_key, _) = self.object_path(namespace, key)?;
        let Some(first) = path_key.first_path_name() else {
            return Ok(());
        };
        let bucket = self.namespace_dir(namespace)?.join(first);

        match fs::remove_dir_all(&bucket).await {
            Ok(()) => {
                info!(namespace = %namespace, key = %key, bucket = %bucket.display(), "Deleted bucket");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire store root
    pub async fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_temp(&self, target: &Path) -> Result<(PathBuf, File)> {
        let dir = target
            .parent()
            .ok_or_else(|| PeerStoreError::Storage("object path has no parent".to_string()))?;
        fs::create_dir_all(dir).await?;

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let suffix: u64 = rand::thread_rng().gen();
        let tmp_path = dir.join(format!(".{}.{:016x}.tmp", name, suffix));

        let file = File::create(&tmp_path).await?;
        Ok((tmp_path, file))
    }

    async fn commit(&self, mut file: File, tmp_path: &Path, target: &Path) -> Result<()> {
        let result = async move {
            file.flush().await?;
            drop(file);
            fs::rename(tmp_path, target).await
        }
        .await;

        if let Err(e) = result {
            discard_temp(tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.root)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A path piece must be exactly one normal component: no separators,
/// no `.`/`..`, not empty and not absolute.
fn check_component(part: &str) -> Result<()> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == part => Ok(()),
        _ => Err(PeerStoreError::Storage(format!(
            "invalid path component: {:?}",
            part
        ))),
    }
}

fn not_found_or(e: std::io::Error, key: &str) -> PeerStoreError {
    if e.kind() == ErrorKind::NotFound {
        PeerStoreError::NotFound(key.to_string())
    } else {
        PeerStoreError::Io(e)
    }
}

async fn discard_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove temp file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::cas_path_transform;
    use peerstore_core::crypto::copy_encrypt;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn cas_store(dir: &TempDir) -> Store {
        Store::new(StoreConfig::new(dir.path()).with_cas())
    }

    async fn read_all(store: &Store, ns: &str, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(ns, key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size as usize, buf.len());
        buf
    }

    #[tokio::test]
    async fn test_greeting_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);
        let id = store.id().to_string();

        let mut data: &[u8] = b"hello";
        let n = store.write(&id, "greeting", &mut data).await.unwrap();
        assert_eq!(n, 5);
        assert!(store.has(&id, "greeting").await);
        assert_eq!(read_all(&store, &id, "greeting").await, b"hello");
    }

    #[tokio::test]
    async fn test_layout_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(StoreConfig::new(dir.path()).with_cas().with_id("node-a"));

        let mut data: &[u8] = b"payload";
        store.write("node-a", "something", &mut data).await.unwrap();

        let expected = dir
            .path()
            .join("node-a")
            .join(cas_path_transform("something").full_path());
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_many_keys_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);
        let id = store.id().to_string();

        for i in 0..40 {
            let key = format!("key_{}", i);
            let payload = format!("payload {}", i).into_bytes();
            let mut src: &[u8] = &payload;
            store.write(&id, &key, &mut src).await.unwrap();

            assert!(store.has(&id, &key).await);
            assert_eq!(read_all(&store, &id, &key).await, payload);

            store.delete(&id, &key).await.unwrap();
            assert!(!store.has(&id, &key).await);
            assert!(matches!(
                store.read(&id, &key).await,
                Err(PeerStoreError::NotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_delete_is_bucket_level() {
        let dir = TempDir::new().unwrap();
        // Every key maps under the same first segment.
        let transform: PathTransform = Arc::new(|key: &str| PathKey {
            segments: vec!["bucket".to_string(), key.to_string()],
            filename: key.to_string(),
        });
        let store = Store::new(StoreConfig::new(dir.path()).with_path_transform(transform));

        let mut a: &[u8] = b"a";
        let mut b: &[u8] = b"b";
        store.write("", "first", &mut a).await.unwrap();
        store.write("", "second", &mut b).await.unwrap();

        store.delete("", "first").await.unwrap();
        assert!(!store.has("", "first").await);
        assert!(!store.has("", "second").await);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);
        store.delete("ns", "never-written").await.unwrap();
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);

        let mut data: &[u8] = b"mine";
        store.write("alice", "shared", &mut data).await.unwrap();

        assert!(store.has("alice", "shared").await);
        assert!(!store.has("bob", "shared").await);
        assert!(!store.has("", "shared").await);
    }

    #[tokio::test]
    async fn test_empty_namespace_omitted() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(StoreConfig::new(dir.path()));

        let mut data: &[u8] = b"x";
        store.write("", "plain", &mut data).await.unwrap();
        assert!(dir.path().join("plain").join("plain").is_file());
    }

    #[tokio::test]
    async fn test_edge_sizes() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);

        for size in [0usize, 1, 100 * 1024] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 256) as u8).collect();
            let key = format!("size-{}", size);
            let mut src: &[u8] = &payload;
            let n = store.write("ns", &key, &mut src).await.unwrap();
            assert_eq!(n as usize, size);
            assert_eq!(read_all(&store, "ns", &key).await, payload);
        }
    }

    #[tokio::test]
    async fn test_overwrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);

        let mut first: &[u8] = b"a much longer first version";
        let mut second: &[u8] = b"short";
        store.write("ns", "k", &mut first).await.unwrap();
        store.write("ns", "k", &mut second).await.unwrap();
        assert_eq!(read_all(&store, "ns", "k").await, b"short");
    }

    #[tokio::test]
    async fn test_write_decrypt() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);
        let key = EncryptionKey::generate();

        let mut plain: &[u8] = b"replicated secret";
        let mut cipher = Vec::new();
        copy_encrypt(&key, &mut plain, &mut cipher).await.unwrap();

        let mut src: &[u8] = &cipher;
        let n = store.write_decrypt(&key, "ns", "secret", &mut src).await.unwrap();
        assert_eq!(n, 17);
        assert_eq!(read_all(&store, "ns", "secret").await, b"replicated secret");
    }

    #[tokio::test]
    async fn test_write_decrypt_failure_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = cas_store(&dir);
        let key = EncryptionKey::generate();

        let mut short: &[u8] = &[0u8; 4];
        let result = store.write_decrypt(&key, "ns", "broken", &mut short).await;
        assert!(matches!(result, Err(PeerStoreError::Decryption(_))));
        assert!(!store.has("ns", "broken").await);
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(StoreConfig::new(dir.path().join("root")));

        for key in ["..", ".", "", "a/b", "/etc"] {
            let mut data: &[u8] = b"x";
            assert!(store.write("", key, &mut data).await.is_err(), "key {:?}", key);
            assert!(!store.has("", key).await);
        }

        let mut data: &[u8] = b"x";
        assert!(store.write("..", "ok", &mut data).await.is_err());
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = Store::new(StoreConfig::new(dir.path().join("root")).with_cas());

        let mut data: &[u8] = b"gone soon";
        store.write("ns", "k", &mut data).await.unwrap();
        store.clear().await.unwrap();

        assert!(!store.has("ns", "k").await);
        assert!(!dir.path().join("root").exists());
        // Clearing twice is fine.
        store.clear().await.unwrap();
    }

    #[test]
    fn test_generated_id() {
        let a = Store::new(StoreConfig::default());
        let b = Store::new(StoreConfig::default());
        assert_eq!(a.id().len(), 64);
        assert_ne!(a.id(), b.id());

        let pinned = Store::new(StoreConfig::default().with_id("fixed"));
        assert_eq!(pinned.id(), "fixed");
    }
}
