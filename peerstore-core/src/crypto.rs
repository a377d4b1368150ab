//! Cryptographic primitives for peerstore
//!
//! Provides:
//! - AES in counter mode as a stream transform (encrypt/decrypt while copying)
//! - Random encryption keys and node identifiers
//!
//! The transform gives confidentiality only. There is no authentication tag,
//! so truncation or bit flips are not detected here.
//!
//! Wire layout of an encrypted stream:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ IV (16 B)    │ AES-CTR(keystream) ⊕ payload │
//! └──────────────┴──────────────────────────────┘
//! ```

use crate::error::{PeerStoreError, Result};
use crate::COPY_BUFFER_SIZE;
use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// AES-256 key size (32 bytes), the size of generated keys
pub const KEY_SIZE: usize = 32;

/// Key sizes accepted by the transform (AES-128, AES-192, AES-256)
pub const SUPPORTED_KEY_SIZES: &[usize] = &[16, 24, 32];

/// Initialization vector size, equal to the AES block size (16 bytes)
pub const IV_SIZE: usize = 16;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Symmetric key for the stream transform
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    /// Generate a new random 32-byte key
    pub fn generate() -> Self {
        let mut key = vec![0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if !SUPPORTED_KEY_SIZES.contains(&slice.len()) {
            return Err(PeerStoreError::InvalidKeyLength {
                expected: SUPPORTED_KEY_SIZES,
                actual: slice.len(),
            });
        }
        Ok(Self(slice.to_vec()))
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| PeerStoreError::Configuration(format!("invalid key hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Hex encoding of the key, for writing into config files
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED; {}])", self.0.len())
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

/// Generate a random node identifier: 32 random bytes, hex-encoded.
pub fn generate_id() -> String {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// MD5 hex digest of a logical key.
///
/// Used to name objects on the wire and on replicas when payloads are
/// encrypted, so peers never see the plaintext key.
pub fn hash_key(key: &str) -> String {
    format!("{:x}", md5::compute(key.as_bytes()))
}

/// Keystream generator for one direction of one stream.
enum CtrStream {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
}

impl CtrStream {
    fn new(key: &EncryptionKey, iv: &[u8; IV_SIZE]) -> Result<Self> {
        let k = key.as_bytes();
        let init_err = |e: ctr::cipher::InvalidLength| PeerStoreError::Encryption(e.to_string());
        let stream = match k.len() {
            16 => Self::Aes128(Aes128Ctr::new_from_slices(k, iv).map_err(init_err)?),
            24 => Self::Aes192(Aes192Ctr::new_from_slices(k, iv).map_err(init_err)?),
            32 => Self::Aes256(Aes256Ctr::new_from_slices(k, iv).map_err(init_err)?),
            other => {
                return Err(PeerStoreError::InvalidKeyLength {
                    expected: SUPPORTED_KEY_SIZES,
                    actual: other,
                })
            }
        };
        Ok(stream)
    }

    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Self::Aes128(c) => c.apply_keystream(buf),
            Self::Aes192(c) => c.apply_keystream(buf),
            Self::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// XOR the keystream over `src` in bounded chunks, writing to `dst`.
/// Returns the number of payload bytes written.
async fn copy_stream<R, W>(stream: &mut CtrStream, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.apply(&mut buf[..n]);
        dst.write_all(&buf[..n]).await?;
        written += n as u64;
    }
    dst.flush().await?;
    Ok(written)
}

/// Encrypt `src` into `dst` with AES-CTR.
///
/// A fresh random IV is written to `dst` in the clear before the ciphertext.
/// The returned count includes the IV, so it equals the number of bytes a
/// receiver must read to get the whole encrypted stream.
pub async fn copy_encrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let mut stream = CtrStream::new(key, &iv)?;

    dst.write_all(&iv).await?;
    let n = copy_stream(&mut stream, src, dst).await?;
    Ok(IV_SIZE as u64 + n)
}

/// Decrypt `src` into `dst`: read the IV prefix, then reverse the keystream.
///
/// Returns the number of plaintext bytes written to `dst`.
pub async fn copy_decrypt<R, W>(key: &EncryptionKey, src: &mut R, dst: &mut W) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut iv = [0u8; IV_SIZE];
    src.read_exact(&mut iv).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PeerStoreError::Decryption("stream shorter than the IV prefix".to_string())
        } else {
            PeerStoreError::Io(e)
        }
    })?;
    let mut stream = CtrStream::new(key, &iv)?;
    copy_stream(&mut stream, src, dst).await
}
