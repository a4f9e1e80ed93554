use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::types::ServerId;

/// Addresses one cache entry.
///
/// The key is built from stable, human-readable metadata (server id, the
/// canonical remote path, and for thumbnails the frame offset). The metadata
/// is SHA-256 hashed to form the on-disk location, so remote path text never
/// appears in local file names.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path())
    }
}

impl CacheKey {
    /// Creates the key for a fully fetched video file.
    pub fn for_video(server: ServerId, remote_path: &str) -> Self {
        Self::from_metadata(format!("server: {}\npath: {remote_path}\n", server.0))
    }

    /// Creates the key for a thumbnail derived from a video.
    ///
    /// The frame offset is part of the key, so thumbnails taken at
    /// different positions cache independently.
    pub fn for_thumbnail(server: ServerId, remote_path: &str, frame_offset: Duration) -> Self {
        Self::from_metadata(format!(
            "server: {}\npath: {remote_path}\nthumbnail: {}ms\n",
            server.0,
            frame_offset.as_millis(),
        ))
    }

    fn from_metadata(metadata: String) -> Self {
        let hash = Sha256::digest(&metadata);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        CacheKey {
            metadata: metadata.into(),
            hash,
        }
    }

    /// Returns the human-readable metadata that forms the basis of the key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is the sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push('/');
        for b in &self.hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }
}
