//! Cache key strategies
//!
//! A key captures the identity of a file at the moment it was analyzed. Two
//! strategies exist:
//!
//! - [`MetadataKey`]: file name, size and modification time (plus a hash of
//!   the absolute path). Costs one `stat`.
//! - [`ContentKey`]: file name, size and a SHA-256 of the first bytes of the
//!   file. Costs one `stat` and a partial read, but survives tools that
//!   rewrite files without touching mtime.
//!
//! Keys are canonical JSON of a tagged fingerprint. Callers treat them as
//! opaque and go through [`KeyStrategy::is_valid`] to check them.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

/// Default number of leading bytes hashed by [`ContentKey`]
pub const DEFAULT_SAMPLE_SIZE: usize = 8192;

/// Hex characters kept from the path digest
const PATH_HASH_LEN: usize = 16;

/// An opaque cache key derived from a file's identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a raw key string, e.g. one read back from a persisted document
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The key as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derives and verifies cache keys for files on disk
///
/// Implementations must be pure functions of the on-disk state at call time.
pub trait KeyStrategy: Send + Sync + fmt::Debug {
    /// Compute the key for `path`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file does not exist and
    /// [`Error::Io`] if it cannot be inspected.
    fn generate(&self, path: &Path) -> Result<CacheKey>;

    /// Check whether `key` still describes the file at `path`
    ///
    /// Returns false when the file is missing or unreadable, when the key is
    /// malformed or produced by another strategy, or when the identity changed.
    fn is_valid(&self, key: &CacheKey, path: &Path) -> bool;
}

/// Selects a key strategy from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategyKind {
    /// [`MetadataKey`] with path hashing
    #[default]
    Metadata,
    /// [`ContentKey`] with the default sample size
    Content,
}

impl KeyStrategyKind {
    /// Build the strategy this kind names
    #[must_use]
    pub fn build(self) -> Box<dyn KeyStrategy> {
        match self {
            Self::Metadata => Box::new(MetadataKey::new()),
            Self::Content => Box::new(ContentKey::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
enum Fingerprint {
    Metadata {
        file_name: String,
        size: u64,
        mtime: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path_hash: Option<String>,
    },
    Content {
        file_name: String,
        size: u64,
        sample_sha256: String,
    },
}

impl Fingerprint {
    fn encode(&self) -> Result<CacheKey> {
        serde_json::to_string(self)
            .map(CacheKey)
            .map_err(|e| Error::serialization(format!("Failed to encode cache key: {e}")))
    }

    fn decode(key: &CacheKey) -> Option<Self> {
        serde_json::from_str(key.as_str()).ok()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    fs::metadata(path).map_err(|e| Error::from_fs(e, path, "metadata"))
}

fn modified(path: &Path, meta: &fs::Metadata) -> Result<DateTime<Utc>> {
    meta.modified()
        .map(DateTime::<Utc>::from)
        .map_err(|e| Error::io(e, path, "modified"))
}

fn path_hash(path: &Path) -> String {
    let absolute = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let digest = Sha256::digest(absolute.to_string_lossy().as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(PATH_HASH_LEN);
    hex
}

/// Key built from file name, size and modification time
#[derive(Debug, Clone)]
pub struct MetadataKey {
    hash_path: bool,
}

impl MetadataKey {
    /// Metadata key that also hashes the absolute path, so two files can
    /// only share a key if they are the same path
    #[must_use]
    pub fn new() -> Self {
        Self { hash_path: true }
    }

    /// Metadata key without the path component
    ///
    /// Keys stay identical when a file is moved or renamed within the same
    /// name, which lets the manager remap entries for moved files. Distinct
    /// files with equal name, size and mtime collide under this strategy.
    #[must_use]
    pub fn portable() -> Self {
        Self { hash_path: false }
    }

    fn fingerprint(&self, path: &Path) -> Result<Fingerprint> {
        let meta = stat(path)?;
        Ok(Fingerprint::Metadata {
            file_name: file_name(path),
            size: meta.len(),
            mtime: modified(path, &meta)?,
            path_hash: self.hash_path.then(|| path_hash(path)),
        })
    }
}

impl Default for MetadataKey {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStrategy for MetadataKey {
    fn generate(&self, path: &Path) -> Result<CacheKey> {
        self.fingerprint(path)?.encode()
    }

    fn is_valid(&self, key: &CacheKey, path: &Path) -> bool {
        let Some(cached @ Fingerprint::Metadata { .. }) = Fingerprint::decode(key) else {
            return false;
        };
        self.fingerprint(path).is_ok_and(|current| current == cached)
    }
}

/// Key built from file name, size and a hash of the leading bytes
#[derive(Debug, Clone)]
pub struct ContentKey {
    sample_size: usize,
}

impl ContentKey {
    /// Content key hashing the first [`DEFAULT_SAMPLE_SIZE`] bytes
    #[must_use]
    pub fn new() -> Self {
        Self::with_sample_size(DEFAULT_SAMPLE_SIZE)
    }

    /// Content key hashing the first `sample_size` bytes
    #[must_use]
    pub fn with_sample_size(sample_size: usize) -> Self {
        Self { sample_size }
    }

    fn sample_hash(&self, path: &Path) -> Result<String> {
        let file = File::open(path).map_err(|e| Error::from_fs(e, path, "open"))?;
        let mut sample = Vec::with_capacity(self.sample_size.min(DEFAULT_SAMPLE_SIZE));
        file.take(self.sample_size as u64)
            .read_to_end(&mut sample)
            .map_err(|e| Error::io(e, path, "read"))?;
        Ok(hex::encode(Sha256::digest(&sample)))
    }
}

impl Default for ContentKey {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStrategy for ContentKey {
    fn generate(&self, path: &Path) -> Result<CacheKey> {
        let meta = stat(path)?;
        Fingerprint::Content {
            file_name: file_name(path),
            size: meta.len(),
            sample_sha256: self.sample_hash(path)?,
        }
        .encode()
    }

    fn is_valid(&self, key: &CacheKey, path: &Path) -> bool {
        let Some(Fingerprint::Content {
            file_name: cached_name,
            size: cached_size,
            sample_sha256: cached_hash,
        }) = Fingerprint::decode(key)
        else {
            return false;
        };

        // Size first; the partial read is only needed when it still matches
        let Ok(meta) = stat(path) else {
            return false;
        };
        if meta.len() != cached_size || file_name(path) != cached_name {
            return false;
        }
        self.sample_hash(path)
            .is_ok_and(|current| current == cached_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn metadata_key_is_stable() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "kick.wav", b"RIFF....WAVE");
        let strategy = MetadataKey::new();

        let k1 = strategy.generate(&path).unwrap();
        let k2 = strategy.generate(&path).unwrap();
        assert_eq!(k1, k2);
        assert!(strategy.is_valid(&k1, &path));
    }

    #[test]
    fn metadata_key_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = MetadataKey::new()
            .generate(&dir.path().join("gone.wav"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn metadata_key_invalid_after_size_change() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "snare.wav", b"short");
        let strategy = MetadataKey::new();
        let key = strategy.generate(&path).unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        fs::write(&path, b"much longer content").unwrap();
        set_mtime(&path, mtime);

        assert!(!strategy.is_valid(&key, &path));
    }

    #[test]
    fn metadata_key_invalid_after_mtime_change() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "hat.wav", b"hat");
        let strategy = MetadataKey::new();
        let key = strategy.generate(&path).unwrap();

        set_mtime(&path, SystemTime::now() - Duration::from_secs(3600));

        assert!(!strategy.is_valid(&key, &path));
    }

    #[test]
    fn metadata_key_invalid_when_file_removed() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "tom.wav", b"tom");
        let strategy = MetadataKey::new();
        let key = strategy.generate(&path).unwrap();

        fs::remove_file(&path).unwrap();
        assert!(!strategy.is_valid(&key, &path));
    }

    #[test]
    fn metadata_key_differs_by_path_unless_portable() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();
        let first = write(&dir, "a/loop.wav", b"same");
        let second = write(&dir, "b/loop.wav", b"same");
        let when = SystemTime::now() - Duration::from_secs(60);
        set_mtime(&first, when);
        set_mtime(&second, when);

        let hashed = MetadataKey::new();
        assert_ne!(
            hashed.generate(&first).unwrap(),
            hashed.generate(&second).unwrap()
        );

        let portable = MetadataKey::portable();
        assert_eq!(
            portable.generate(&first).unwrap(),
            portable.generate(&second).unwrap()
        );
    }

    #[test]
    fn malformed_key_is_never_valid() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "pad.wav", b"pad");
        let garbage = CacheKey::from_raw("not json at all");

        assert!(!MetadataKey::new().is_valid(&garbage, &path));
        assert!(!ContentKey::new().is_valid(&garbage, &path));
    }

    #[test]
    fn keys_from_other_strategy_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "bass.wav", b"bass");

        let content_key = ContentKey::new().generate(&path).unwrap();
        let metadata_key = MetadataKey::new().generate(&path).unwrap();

        assert!(!MetadataKey::new().is_valid(&content_key, &path));
        assert!(!ContentKey::new().is_valid(&metadata_key, &path));
    }

    #[test]
    fn content_key_detects_same_size_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "vox.wav", b"AAAA");
        let strategy = ContentKey::new();
        let key = strategy.generate(&path).unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        fs::write(&path, b"BBBB").unwrap();
        set_mtime(&path, mtime);

        assert!(!strategy.is_valid(&key, &path));
    }

    #[test]
    fn content_key_ignores_bytes_past_sample() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "fx.wav", b"headerTAIL");
        let strategy = ContentKey::with_sample_size(6);
        let key = strategy.generate(&path).unwrap();

        fs::write(&path, b"headerXXXX").unwrap();

        assert!(strategy.is_valid(&key, &path));
    }

    #[test]
    fn strategy_kind_deserializes_snake_case() {
        let kind: KeyStrategyKind = serde_json::from_str("\"content\"").unwrap();
        assert_eq!(kind, KeyStrategyKind::Content);
        assert_eq!(KeyStrategyKind::default(), KeyStrategyKind::Metadata);
    }

    #[test]
    fn key_is_canonical_json() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "clap.wav", b"clap");
        let key = MetadataKey::portable().generate(&path).unwrap();

        let value: serde_json::Value = serde_json::from_str(key.as_str()).unwrap();
        assert_eq!(value["strategy"], "metadata");
        assert_eq!(value["file_name"], "clap.wav");
        assert_eq!(value["size"], 4);
        assert!(value.get("path_hash").is_none());
    }
}
