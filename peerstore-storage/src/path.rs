//! Key to path mapping
//!
//! A path transform turns a logical key into a [`PathKey`]: the directory
//! segments an object lives under plus its filename. Every node must apply
//! the same transform so replicas land at the same relative location.

use sha1::{Digest, Sha1};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Width of one directory segment produced by the CAS transform
pub const CAS_SEGMENT_WIDTH: usize = 5;

/// Pluggable key to path mapping
pub type PathTransform = Arc<dyn Fn(&str) -> PathKey + Send + Sync>;

/// Location of an object relative to its namespace directory
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// Ordered directory segments
    pub segments: Vec<String>,
    /// Final file name
    pub filename: String,
}

impl PathKey {
    /// Directory portion joined with `/`
    pub fn path_name(&self) -> String {
        self.segments.join("/")
    }

    /// First directory segment; the unit removed by a bucket delete
    pub fn first_path_name(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Segments followed by the filename, as a relative path
    pub fn full_path(&self) -> PathBuf {
        let mut path: PathBuf = self.segments.iter().collect();
        path.push(&self.filename);
        path
    }
}

/// Content-addressable transform.
///
/// The SHA-1 hex digest of the key is split into 5-character directory
/// segments and also used whole as the filename.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = Sha1::digest(key.as_bytes());
    let hash = hex::encode(digest);

    let segments = hash
        .as_bytes()
        .chunks(CAS_SEGMENT_WIDTH)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();

    PathKey {
        segments,
        filename: hash,
    }
}

/// Identity transform: the key is both the single directory and the filename.
pub fn identity_path_transform(key: &str) -> PathKey {
    PathKey {
        segments: vec![key.to_string()],
        filename: key.to_string(),
    }
}

/// Named transforms selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathTransformKind {
    /// SHA-1 content addressing
    #[default]
    Cas,
    /// Key used verbatim
    Identity,
}

impl PathTransformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cas => "cas",
            Self::Identity => "identity",
        }
    }

    pub fn transform(&self) -> PathTransform {
        match self {
            Self::Cas => Arc::new(cas_path_transform),
            Self::Identity => Arc::new(identity_path_transform),
        }
    }
}

impl fmt::Display for PathTransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PathTransformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cas" => Ok(Self::Cas),
            "identity" => Ok(Self::Identity),
            other => Err(format!("unknown path transform: {}", other)),
        }
    }
}
