use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tempfile::NamedTempFile;

use crate::error::GatewayError;

use super::CacheKey;

/// The future a fetch callback returns. It must fully write the file at the
/// path it was given; the store takes care of atomic promotion.
pub type FetchFuture = BoxFuture<'static, Result<(), GatewayError>>;

type FlightResult = Result<CachedFile, GatewayError>;
type SharedFlight = Shared<oneshot::Receiver<FlightResult>>;

/// A ready cache entry: an immutable, fully written local file.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub path: PathBuf,
    pub size: u64,
    pub created_at: SystemTime,
    last_access: Arc<AtomicU64>,
}

impl CachedFile {
    fn new(path: PathBuf, size: u64) -> Self {
        CachedFile {
            path,
            size,
            created_at: SystemTime::now(),
            last_access: Arc::new(AtomicU64::new(now_millis())),
        }
    }

    /// Marks the entry as used. Eviction order is derived from this stamp,
    /// which is what makes eviction LRU.
    fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
    }

    pub fn last_access(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.last_access.load(Ordering::Relaxed))
    }

    fn last_access_millis(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// The result of a cache lookup.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub file: CachedFile,
    /// `true` if the file was already ready when the request arrived.
    pub hit: bool,
}

/// Aggregate statistics over the ready entries of one store.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub quota_bytes: u64,
    pub oldest_access: Option<SystemTime>,
    pub newest_access: Option<SystemTime>,
}

enum Entry {
    /// A fetch is in progress; concurrent requesters await the same flight.
    Fetching {
        flight: SharedFlight,
        generation: u64,
    },
    Ready(CachedFile),
}

struct StoreState {
    entries: HashMap<CacheKey, Entry>,
    /// Stamps in-flight fetches so an `invalidate` racing a completion can
    /// not resurrect a removed entry.
    next_generation: u64,
}

/// A disk-backed, key-addressed cache of materialized files.
///
/// Guarantees at most one in-progress fetch per key, promotes fetched files
/// atomically from a temp directory, keeps total ready bytes under the
/// configured quota by least-recently-used eviction, and never serves a
/// partially written file.
pub struct CacheStore {
    name: &'static str,
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    quota_bytes: u64,
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .field("entries", &state.entries.len())
            .field("quota_bytes", &self.quota_bytes)
            .finish()
    }
}

impl CacheStore {
    pub fn new(
        name: &'static str,
        cache_dir: PathBuf,
        tmp_dir: PathBuf,
        quota_bytes: u64,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        Ok(CacheStore {
            name,
            cache_dir,
            tmp_dir,
            quota_bytes,
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                next_generation: 0,
            }),
        })
    }

    /// Returns the ready local file for `key`, fetching it at most once.
    ///
    /// Concurrent callers for the same key share one fetch and all receive
    /// the same file or the same error. The fetch runs as a detached task,
    /// so one caller going away does not abort a flight other waiters
    /// share. A ready entry whose backing file has disappeared is treated
    /// as a miss and re-fetched.
    pub async fn get_or_fetch<F>(
        self: &Arc<Self>,
        key: &CacheKey,
        fetch: F,
    ) -> Result<CacheOutcome, GatewayError>
    where
        F: FnOnce(PathBuf) -> FetchFuture + Send + 'static,
    {
        let (flight, generation) = {
            let mut state = self.state.lock().unwrap();

            if let Some(Entry::Ready(file)) = state.entries.get(key) {
                if file.path.is_file() {
                    file.touch();
                    return Ok(CacheOutcome {
                        file: file.clone(),
                        hit: true,
                    });
                }
                tracing::warn!(
                    cache = self.name,
                    key = %key,
                    "ready cache entry lost its file, treating as miss"
                );
                state.entries.remove(key);
            }

            match state.entries.get(key) {
                Some(Entry::Fetching { flight, generation }) => (flight.clone(), *generation),
                Some(Entry::Ready(_)) => unreachable!("ready entries returned above"),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let flight = rx.shared();
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    state.entries.insert(
                        key.clone(),
                        Entry::Fetching {
                            flight: flight.clone(),
                            generation,
                        },
                    );

                    let slf = Arc::clone(self);
                    let key = key.clone();
                    tokio::spawn(async move {
                        let result = slf.run_flight(&key, generation, fetch).await;
                        // All waiters gone is fine, the entry is promoted
                        // regardless.
                        let _ = tx.send(result);
                    });

                    (flight, generation)
                }
            }
        };

        let file = self.join_flight(key, flight, generation).await?;
        Ok(CacheOutcome { file, hit: false })
    }

    /// Awaits a shared flight and cleans up after a flight whose task died
    /// without reporting (panic or runtime shutdown).
    async fn join_flight(
        &self,
        key: &CacheKey,
        flight: SharedFlight,
        generation: u64,
    ) -> FlightResult {
        match flight.await {
            Ok(result) => result,
            Err(_canceled) => {
                self.remove_if_fetching(key, generation);
                Err(GatewayError::Internal("cache fetch task died".into()))
            }
        }
    }

    /// Executes one fetch: temp file, fetch callback, atomic promotion,
    /// eviction pass. Failures remove the in-flight entry so the key can be
    /// retried by a later request.
    async fn run_flight<F>(self: &Arc<Self>, key: &CacheKey, generation: u64, fetch: F) -> FlightResult
    where
        F: FnOnce(PathBuf) -> FetchFuture,
    {
        let result = self.fetch_to_tempfile(key, fetch).await;

        let mut state = self.state.lock().unwrap();
        match result {
            Ok(file) => {
                match state.entries.get(key) {
                    Some(Entry::Fetching { generation: g, .. }) if *g == generation => {
                        state.entries.insert(key.clone(), Entry::Ready(file.clone()));
                    }
                    _ => {
                        // Invalidated or cleared mid-flight; the persisted
                        // file must not outlive its entry.
                        drop(state);
                        remove_file_quiet(&file.path);
                        return Err(GatewayError::Internal(
                            "cache entry invalidated during fetch".into(),
                        ));
                    }
                }
                drop(state);
                self.evict_over_quota(key);
                Ok(file)
            }
            Err(err) => {
                if matches!(
                    state.entries.get(key),
                    Some(Entry::Fetching { generation: g, .. }) if *g == generation
                ) {
                    state.entries.remove(key);
                }
                Err(err)
            }
        }
    }

    async fn fetch_to_tempfile<F>(&self, key: &CacheKey, fetch: F) -> FlightResult
    where
        F: FnOnce(PathBuf) -> FetchFuture,
    {
        let temp_file = self.tempfile()?;
        fetch(temp_file.path().to_owned()).await?;

        let size = temp_file.as_file().metadata()?.len();
        let cache_path = self.cache_dir.join(key.cache_path());
        persist_tempfile(temp_file, &cache_path)?;
        tracing::debug!(cache = self.name, key = %key, size, "cache entry written");

        Ok(CachedFile::new(cache_path, size))
    }

    /// Removes the entry for `key` regardless of state. Safe to call when
    /// absent. An in-flight fetch is detached: its waiters receive an error
    /// and its file, if it completes, is deleted instead of promoted.
    pub fn invalidate(&self, key: &CacheKey) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.entries.remove(key)
        };
        if let Some(Entry::Ready(file)) = removed {
            remove_file_quiet(&file.path);
            tracing::debug!(cache = self.name, key = %key, "cache entry invalidated");
        }
    }

    /// While total ready bytes exceed the quota, removes entries in
    /// ascending last-access order. The just-inserted entry is never
    /// evicted: a single file larger than the whole quota is accepted and
    /// reported as a degraded condition instead.
    fn evict_over_quota(&self, just_inserted: &CacheKey) {
        let victims = {
            let state = self.state.lock().unwrap();

            let mut total: u64 = 0;
            let mut candidates = Vec::new();
            for (key, entry) in state.entries.iter() {
                if let Entry::Ready(file) = entry {
                    total += file.size;
                    if key != just_inserted {
                        candidates.push((key.clone(), file.last_access_millis(), file.size));
                    }
                }
            }

            if total <= self.quota_bytes {
                return;
            }

            candidates.sort_by_key(|(_, last_access, _)| *last_access);

            let mut victims = Vec::new();
            for (key, _, size) in candidates {
                if total <= self.quota_bytes {
                    break;
                }
                total -= size;
                victims.push(key);
            }

            if total > self.quota_bytes {
                tracing::warn!(
                    cache = self.name,
                    total_bytes = total,
                    quota_bytes = self.quota_bytes,
                    "single cache entry exceeds quota, keeping it anyway"
                );
            }

            victims
        };

        // The victim set was computed under the lock; file deletion happens
        // outside it.
        for key in victims {
            let removed = {
                let mut state = self.state.lock().unwrap();
                state.entries.remove(&key)
            };
            if let Some(Entry::Ready(file)) = removed {
                tracing::debug!(cache = self.name, key = %key, size = file.size, "evicted");
                remove_file_quiet(&file.path);
            }
        }
    }

    pub fn status(&self) -> CacheStats {
        let state = self.state.lock().unwrap();

        let mut stats = CacheStats {
            entry_count: 0,
            total_bytes: 0,
            quota_bytes: self.quota_bytes,
            oldest_access: None,
            newest_access: None,
        };

        for entry in state.entries.values() {
            if let Entry::Ready(file) = entry {
                stats.entry_count += 1;
                stats.total_bytes += file.size;
                let access = file.last_access();
                stats.oldest_access = Some(match stats.oldest_access {
                    Some(oldest) => oldest.min(access),
                    None => access,
                });
                stats.newest_access = Some(match stats.newest_access {
                    Some(newest) => newest.max(access),
                    None => access,
                });
            }
        }

        stats
    }

    /// Drops every entry and deletes all files in the cache directory,
    /// including leftovers from previous runs. Returns the number of files
    /// removed. In-flight fetches are detached and clean up after
    /// themselves once they complete.
    pub fn clear(&self) -> io::Result<u64> {
        {
            let mut state = self.state.lock().unwrap();
            state.entries.clear();
        }
        let removed = remove_files_recursive(&self.cache_dir)?;
        tracing::info!(cache = self.name, removed, "cache cleared");
        Ok(removed)
    }

    fn remove_if_fetching(&self, key: &CacheKey, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if matches!(
            state.entries.get(key),
            Some(Entry::Fetching { generation: g, .. }) if *g == generation
        ) {
            state.entries.remove(key);
        }
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // A concurrent `clear` could remove the directory we operate in, so
        // retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = std::fs::create_dir_all(&self.tmp_dir) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %self.tmp_dir.display(),
                    "failed to create cache tmp directory"
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %self.tmp_dir.display(),
                        "failed to create cache temp file"
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<std::fs::File> {
    let parent = cache_path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory to persist item")
    })?;

    // A concurrent `clear` could remove the parent directories we are
    // operating in, so retry the fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "failed to create cache directory"
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %cache_path.display(),
                    "failed to persist cache file"
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

fn remove_file_quiet(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %path.display(),
                "failed to remove cache file"
            );
        }
    }
}

fn remove_files_recursive(directory: &Path) -> io::Result<u64> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            removed += remove_files_recursive(&path)?;
            let _ = std::fs::remove_dir(&path);
        } else {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
