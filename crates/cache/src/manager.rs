//! Cache manager: the in-memory table, persistence and eviction
//!
//! The manager keeps three maps in lockstep (`path → entry`, `path → key`,
//! `key → path`) behind a single mutex shared by worker threads and the
//! optional background persistence thread. Nothing in the public surface
//! returns an error: failures are logged and behave like a cache miss.

use crate::config::CacheSettings;
use crate::document::{CacheDocument, CacheEntry};
use crate::key::{CacheKey, KeyStrategy};
use crate::storage::{FileStorage, StorageBackend};
use crate::value::to_portable;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending save requests the background thread will queue before dropping
const SAVE_QUEUE_CAPACITY: usize = 64;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time view of the cache counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries dropped because their file changed or by request
    pub invalidations: u64,
    /// Entries dropped by the size limit or by expiration at load
    pub evictions: u64,
    /// Entries currently resident
    pub entry_count: usize,
    /// Size of the persisted document after the last save or load
    pub size_bytes: u64,
    /// `hits / (hits + misses)`, 0 before the first lookup
    pub hit_ratio: f64,
    /// `size_bytes` in MiB
    pub size_mb: f64,
    /// Configured size limit in MiB
    pub max_size_mb: f64,
    /// Whether the cache is enabled
    pub enabled: bool,
    /// Whether a background thread persists the cache
    pub background_saving: bool,
    /// Location of the persisted document
    pub cache_file: PathBuf,
    /// Time spent loading the document at startup
    pub load_time: Duration,
    /// Time spent in the most recent save
    pub save_time: Duration,
    /// When the most recent save finished
    pub last_save: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    invalidations: u64,
    evictions: u64,
    size_bytes: u64,
    load_time: Duration,
    save_time: Duration,
    last_save: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveMode {
    /// Write even if nothing changed since the last save
    Forced,
    /// Write only if the table changed since the last save
    IfDirty,
}

/// The live table. Every method keeps the three maps consistent.
#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    path_to_key: HashMap<PathBuf, CacheKey>,
    key_to_path: HashMap<CacheKey, PathBuf>,
    document: CacheDocument,
    counters: Counters,
    dirty: bool,
    /// Set by eviction; `counters.size_bytes` predates it until the next save
    size_stale: bool,
}

impl CacheState {
    fn insert(&mut self, path: PathBuf, key: CacheKey, entry: CacheEntry) {
        if let Some(old_key) = self.path_to_key.get(&path)
            && *old_key != key
        {
            let old_key = old_key.clone();
            self.key_to_path.remove(&old_key);
            self.document.entries.remove(&old_key);
        }
        self.key_to_path.insert(key.clone(), path.clone());
        self.path_to_key.insert(path.clone(), key);
        self.entries.insert(path, entry);
        self.dirty = true;
    }

    fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        let key = self.path_to_key.remove(path)?;
        self.key_to_path.remove(&key);
        self.document.entries.remove(&key);
        self.dirty = true;
        self.entries.remove(path)
    }

    /// Move the entry stored under `from` to `to`, keeping its key
    fn migrate(&mut self, from: &Path, to: &Path) -> Option<&mut CacheEntry> {
        let key = self.path_to_key.remove(from)?;
        let Some(entry) = self.entries.remove(from) else {
            self.key_to_path.remove(&key);
            return None;
        };
        self.key_to_path.insert(key.clone(), to.to_path_buf());
        self.path_to_key.insert(to.to_path_buf(), key);
        self.dirty = true;
        Some(self.entries.entry(to.to_path_buf()).or_insert(entry))
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.path_to_key.clear();
        self.key_to_path.clear();
        self.document.entries.clear();
        self.counters.size_bytes = 0;
        self.dirty = false;
        self.size_stale = false;
    }

    /// Copy the live table into the pending document
    fn sync_document(&mut self) {
        let entries = &self.entries;
        self.document.entries = self
            .path_to_key
            .iter()
            .filter_map(|(path, key)| {
                entries
                    .get(path)
                    .map(|entry| (key.clone(), entry.to_persisted(path)))
            })
            .collect();
        self.document.metadata.last_saved = Some(Utc::now());
        self.document.metadata.entry_count = self.document.entries.len();
    }
}

/// State shared with the background persistence thread
#[derive(Debug)]
struct Shared {
    state: Mutex<CacheState>,
    storage: Box<dyn StorageBackend>,
    keys: Box<dyn KeyStrategy>,
}

impl Shared {
    fn save(&self, mode: SaveMode) -> bool {
        let mut state = self.state.lock();
        self.save_locked(&mut state, mode)
    }

    /// Serialize and write the table. Holds the table lock for the whole
    /// write, so lookups wait for a slow save.
    fn save_locked(&self, state: &mut CacheState, mode: SaveMode) -> bool {
        if mode == SaveMode::IfDirty && !state.dirty {
            return true;
        }

        let start = Instant::now();
        state.sync_document();
        let saved = self.storage.save(&state.document);

        state.counters.save_time = start.elapsed();
        state.counters.last_save = Some(Utc::now());
        state.counters.size_bytes = self.storage.size_bytes();
        state.size_stale = false;

        if saved {
            state.dirty = false;
            debug!(
                entries = state.entries.len(),
                elapsed_ms = state.counters.save_time.as_millis(),
                "Saved cache"
            );
        } else {
            warn!("Failed to save cache; entries stay in memory");
        }
        saved
    }

    fn load(&self, expiration: Option<chrono::Duration>) {
        let start = Instant::now();
        let document = self.storage.load();
        let cutoff = expiration.map(|age| Utc::now() - age);

        let mut state = self.state.lock();
        state.document.metadata = document.metadata;
        let mut expired = 0u64;
        for (key, persisted) in document.entries {
            if cutoff.is_some_and(|cutoff| persisted.created_at < cutoff) {
                expired += 1;
                continue;
            }
            let (path, entry) = CacheEntry::from_persisted(persisted);
            if state.path_to_key.contains_key(&path) {
                debug!(path = %path.display(), "Skipping duplicate cache entry for path");
                continue;
            }
            state.document.entries.insert(key.clone(), entry.to_persisted(&path));
            state.insert(path, key, entry);
        }
        state.dirty = expired > 0;
        state.counters.evictions += expired;
        state.counters.size_bytes = self.storage.size_bytes();
        state.counters.load_time = start.elapsed();

        info!(
            entries = state.entries.len(),
            expired,
            elapsed_ms = state.counters.load_time.as_millis(),
            "Loaded cache entries"
        );
    }
}

/// Handle to the background persistence thread
struct PersistWorker {
    requests: SyncSender<()>,
    cancel: CancellationToken,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

impl PersistWorker {
    fn spawn(shared: Arc<Shared>, interval: Duration) -> std::io::Result<Self> {
        let (requests, queue) = mpsc::sync_channel(SAVE_QUEUE_CAPACITY);
        let (done_tx, done) = mpsc::channel();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = thread::Builder::new()
            .name("cache-persist".to_string())
            .spawn(move || {
                persist_loop(&shared, &queue, &token, interval);
                let _ = done_tx.send(());
            })?;

        info!(interval_ms = interval.as_millis(), "Started background cache saving");
        Ok(Self {
            requests,
            cancel,
            done,
            handle,
        })
    }

    /// Queue a save without blocking. Returns false if the thread is gone.
    fn request_save(&self) -> bool {
        match self.requests.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Disconnected(())) => false,
        }
    }

    fn stop(self, timeout: Duration) {
        let Self {
            requests,
            cancel,
            done,
            handle,
        } = self;
        cancel.cancel();
        // Dropping the sender wakes the thread if it is waiting for requests
        drop(requests);

        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!("Background cache saving thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = timeout.as_millis(),
                    "Background cache saving thread did not stop in time"
                );
            }
        }
    }
}

fn persist_loop(shared: &Shared, queue: &Receiver<()>, cancel: &CancellationToken, interval: Duration) {
    while !cancel.is_cancelled() {
        match queue.recv_timeout(interval) {
            Ok(()) => {
                // Coalesce a burst of puts into one write
                while queue.try_recv().is_ok() {}
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if cancel.is_cancelled() {
            break;
        }
        shared.save(SaveMode::IfDirty);
    }
    debug!("Background cache saving stopped");
}

/// Persistent cache of per-file analysis results
///
/// Safe to share between threads (`Arc<CacheManager>`). Values are stored as
/// [`serde_json::Value`]; [`CacheManager::put`] accepts anything
/// serializable and reduces it to that portable form.
pub struct CacheManager {
    shared: Arc<Shared>,
    settings: CacheSettings,
    worker: Mutex<Option<PersistWorker>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("settings", &self.settings)
            .field("storage", &self.shared.storage)
            .field("keys", &self.shared.keys)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Build a manager from settings: the configured key strategy and a
    /// [`FileStorage`] at `cache_file`
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        let keys = settings.key_strategy.build();
        let storage = Box::new(FileStorage::new(settings.cache_file.clone()));
        Self::with_components(settings, keys, storage)
    }

    /// Build a manager with explicit collaborators
    ///
    /// Loads and expiration-filters the persisted document and starts the
    /// background thread when the settings ask for it.
    #[must_use]
    pub fn with_components(
        settings: CacheSettings,
        keys: Box<dyn KeyStrategy>,
        storage: Box<dyn StorageBackend>,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(CacheState::default()),
            storage,
            keys,
        });

        let mut worker = None;
        if settings.enable_cache {
            shared.load(settings.expiration());
            if settings.background_saving {
                match PersistWorker::spawn(Arc::clone(&shared), settings.save_interval()) {
                    Ok(w) => worker = Some(w),
                    Err(e) => {
                        warn!(error = %e, "Could not start background saving, saving inline");
                    }
                }
            }
        } else {
            debug!("Cache disabled");
        }

        Self {
            shared,
            settings,
            worker: Mutex::new(worker),
            shut_down: AtomicBool::new(false),
        }
    }

    /// The settings this manager was built with
    #[must_use]
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Whether the cache is enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.enable_cache
    }

    /// Look up the cached value for `path`
    ///
    /// A tracked entry whose key no longer matches the file is dropped. An
    /// untracked path whose key belongs to a vanished file takes over that
    /// file's entry (the file was moved). A key owned by another existing
    /// file is a collision and reported as a miss.
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Value> {
        let path = path.as_ref();
        let mut state = self.shared.state.lock();

        if !self.settings.enable_cache {
            state.counters.misses += 1;
            return None;
        }

        if let Some(key) = state.path_to_key.get(path).cloned() {
            if self.shared.keys.is_valid(&key, path)
                && let Some(entry) = state.entries.get_mut(path)
            {
                entry.touch();
                let value = entry.value.clone();
                state.dirty = true;
                state.counters.hits += 1;
                return Some(value);
            }
            debug!(path = %path.display(), "Cached entry is stale, dropping it");
            state.remove(path);
            state.counters.invalidations += 1;
        }

        let key = match self.shared.keys.generate(path) {
            Ok(key) => key,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Cannot key file, treating as miss");
                state.counters.misses += 1;
                return None;
            }
        };

        let Some(existing) = state.key_to_path.get(&key).cloned() else {
            state.counters.misses += 1;
            return None;
        };

        if existing.exists() {
            debug!(
                path = %path.display(),
                existing = %existing.display(),
                "Cache key collision"
            );
            state.counters.misses += 1;
            return None;
        }

        let value = state.migrate(&existing, path).map(|entry| {
            entry.touch();
            entry.value.clone()
        });
        match value {
            Some(value) => {
                debug!(
                    from = %existing.display(),
                    to = %path.display(),
                    "File moved, remapped cache entry"
                );
                state.counters.hits += 1;
                Some(value)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// Look up and deserialize the cached value for `path`
    ///
    /// A stored value that does not fit `T` is logged and reported as absent.
    pub fn get_as<T: DeserializeOwned>(&self, path: impl AsRef<Path>) -> Option<T> {
        let path = path.as_ref();
        let value = self.get(path)?;
        match serde_json::from_value(value) {
            Ok(typed) => Some(typed),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cached value has an unexpected shape");
                None
            }
        }
    }

    /// Store `value` for `path`
    ///
    /// The value is reduced to a [`serde_json::Value`] first. Values that do
    /// not serialize or hold NaN or infinite floats, and files that cannot be
    /// keyed, are logged and skipped.
    pub fn put<T: Serialize + ?Sized>(&self, path: impl AsRef<Path>, value: &T) {
        let path = path.as_ref();
        if !self.settings.enable_cache {
            return;
        }
        match to_portable(value) {
            Ok(value) => self.put_value(path, value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Value is not cacheable");
            }
        }
    }

    /// Store an already portable value for `path`
    pub fn put_value(&self, path: impl AsRef<Path>, value: Value) {
        let path = path.as_ref();
        if !self.settings.enable_cache {
            return;
        }

        let key = match self.shared.keys.generate(path) {
            Ok(key) => key,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot key file, not caching");
                return;
            }
        };

        let mut state = self.shared.state.lock();
        if let Some(existing) = state.key_to_path.get(&key).cloned()
            && existing != path
        {
            if existing.exists() {
                debug!(
                    path = %path.display(),
                    existing = %existing.display(),
                    "Cache key collision, keeping existing entry"
                );
                return;
            }
            debug!(
                from = %existing.display(),
                to = %path.display(),
                "Replacing entry of moved file"
            );
            state.remove(&existing);
        }

        state.insert(path.to_path_buf(), key, CacheEntry::new(value));
        debug!(path = %path.display(), "Cached analysis result");

        self.request_save(&mut state);
        self.evict_if_oversized(&mut state);
    }

    /// Drop the entry for `path`, if any
    pub fn invalidate(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        if !self.settings.enable_cache {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.remove(path).is_some() {
            state.counters.invalidations += 1;
            debug!(path = %path.display(), "Invalidated cache entry");
        }
    }

    /// Drop every entry and delete the persisted document
    ///
    /// Lifetime hit, miss, invalidation and eviction counters are kept.
    pub fn clear(&self) {
        if !self.settings.enable_cache {
            return;
        }
        let mut state = self.shared.state.lock();
        let removed = state.entries.len();
        state.clear();
        if !self.shared.storage.clear() {
            warn!("Cache file could not be removed");
        }
        info!(removed, "Cache cleared");
    }

    /// True if `path` has a resident entry; does not touch counters or
    /// validate the file
    #[must_use]
    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .contains_key(path.as_ref())
    }

    /// Number of resident entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    /// True if nothing is resident
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let state = self.shared.state.lock();
        let c = &state.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            invalidations: c.invalidations,
            evictions: c.evictions,
            entry_count: state.entries.len(),
            size_bytes: c.size_bytes,
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
            size_mb: c.size_bytes as f64 / BYTES_PER_MB,
            max_size_mb: self.settings.max_cache_size_mb,
            enabled: self.settings.enable_cache,
            background_saving: self.settings.background_saving,
            cache_file: self.shared.storage.location().to_path_buf(),
            load_time: c.load_time,
            save_time: c.save_time,
            last_save: c.last_save,
        }
    }

    /// Save the table now, whether or not anything changed
    ///
    /// Returns false if the storage backend failed.
    pub fn flush(&self) -> bool {
        if !self.settings.enable_cache {
            return true;
        }
        self.shared.save(SaveMode::Forced)
    }

    /// Stop background saving and write the table one last time
    ///
    /// Waits at most the configured shutdown timeout for the background
    /// thread, then saves on the calling thread regardless. Later calls do
    /// nothing; `put` after shutdown saves inline.
    pub fn shutdown(&self) {
        if !self.settings.enable_cache || self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down cache manager");

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop(self.settings.shutdown_timeout());
        }

        let saved = self.shared.save(SaveMode::Forced);
        let stats = self.stats();
        info!(
            saved,
            entries = stats.entry_count,
            hits = stats.hits,
            misses = stats.misses,
            "Cache shutdown complete"
        );
    }

    fn request_save(&self, state: &mut CacheState) {
        let queued = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(PersistWorker::request_save);
        if !queued {
            self.shared.save_locked(state, SaveMode::IfDirty);
        }
    }

    /// Evict the least recently used third of the table when the persisted
    /// document is over the size limit. Reacts to the size measured at the
    /// last save, not the live table, and at most once per save.
    fn evict_if_oversized(&self, state: &mut CacheState) {
        let Some(limit) = self.settings.max_size_bytes() else {
            return;
        };
        if state.size_stale || state.counters.size_bytes <= limit || state.entries.is_empty() {
            return;
        }

        let mut by_access: Vec<(DateTime<Utc>, PathBuf)> = state
            .entries
            .iter()
            .map(|(path, entry)| (entry.last_access_at, path.clone()))
            .collect();
        by_access.sort();

        let count = (by_access.len() / 3).max(1);
        for (_, path) in by_access.into_iter().take(count) {
            if state.remove(&path).is_some() {
                state.counters.evictions += 1;
            }
        }
        info!(
            evicted = count,
            size_bytes = state.counters.size_bytes,
            limit,
            "Evicted cache entries due to size limit"
        );
        state.size_stale = true;
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
