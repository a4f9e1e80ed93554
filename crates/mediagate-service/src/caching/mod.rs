//! # Cache infrastructure
//!
//! Caching is front and center in mediagate. Remote video files live behind
//! a slow, failure-prone command channel, so every fetched byte is kept on
//! local disk and reused until the remote file is deleted, renamed, or the
//! cache is cleared.
//!
//! There are two cache namespaces, both instances of [`CacheStore`]:
//!
//! - `videos` holds fully fetched video files.
//! - `thumbs` holds still frames derived from cached videos.
//!
//! A cache request goes through the following steps:
//! - If a ready entry exists and its file is still on disk, it is returned
//!   immediately and its last-access stamp is bumped.
//! - If a fetch for the same key is already in flight, the request joins it
//!   and shares its outcome (single-flight).
//! - Otherwise a fetch is started: the payload is written to a temp file in
//!   a sibling `tmp/` directory and atomically renamed into place only on
//!   full success. Nobody ever observes a partially written file.
//!
//! After every successful insert an eviction pass removes the least
//! recently used entries until the namespace is back under its byte quota.
//! A single entry larger than the whole quota is accepted and logged as a
//! degraded condition rather than thrashing the cache.
//!
//! Failures are not persisted: a failed fetch removes the in-flight entry
//! (propagating the error to every waiter), and the next request for the
//! key starts over.

use std::io;
use std::sync::Arc;

use crate::config::Config;

mod key;
mod store;

pub use key::CacheKey;
pub use store::{CacheOutcome, CacheStats, CacheStore, CachedFile, FetchFuture};

/// The two cache namespaces of the gateway.
#[derive(Debug)]
pub struct Caches {
    /// Fully fetched video files.
    pub videos: Arc<CacheStore>,
    /// Derived thumbnail images.
    pub thumbnails: Arc<CacheStore>,
}

impl Caches {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let tmp = config.cache_dir("tmp");

        Ok(Self {
            videos: Arc::new(CacheStore::new(
                "videos",
                config.cache_dir("videos"),
                tmp.clone(),
                config.caches.videos.quota_bytes,
            )?),
            thumbnails: Arc::new(CacheStore::new(
                "thumbs",
                config.cache_dir("thumbs"),
                tmp,
                config.caches.thumbnails.quota_bytes,
            )?),
        })
    }

    /// Clear the temporary files.
    ///
    /// This runs on startup of the gateway process to avoid accidentally
    /// leaving temporary files which survive a hard crash.
    pub fn clear_tmp(&self, config: &Config) -> io::Result<()> {
        let tmp = config.cache_dir("tmp");
        if tmp.exists() {
            std::fs::remove_dir_all(&tmp)?;
        }
        std::fs::create_dir_all(&tmp)?;
        Ok(())
    }

    /// Removes every entry from both namespaces, returning the combined
    /// number of files deleted.
    pub fn clear(&self) -> io::Result<u64> {
        Ok(self.videos.clear()? + self.thumbnails.clear()?)
    }
}
