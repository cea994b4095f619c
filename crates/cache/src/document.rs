//! Cache entries and the persisted cache document

use crate::key::CacheKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Version written into every persisted document
pub const DOCUMENT_VERSION: u32 = 1;

/// A cached analysis result with access bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// The analysis result, reduced to portable primitives
    pub value: Value,
    /// When the value was computed
    pub created_at: DateTime<Utc>,
    /// Last time the value was served
    pub last_access_at: DateTime<Utc>,
    /// Number of times the value was stored or served
    pub access_count: u64,
}

impl CacheEntry {
    /// Create an entry for a freshly computed value
    #[must_use]
    pub fn new(value: Value) -> Self {
        let now = Utc::now();
        Self {
            value,
            created_at: now,
            last_access_at: now,
            access_count: 1,
        }
    }

    /// Record an access
    pub fn touch(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_access_at = Utc::now();
    }

    pub(crate) fn from_persisted(persisted: PersistedEntry) -> (PathBuf, Self) {
        let entry = Self {
            value: persisted.value,
            created_at: persisted.created_at,
            last_access_at: persisted.last_access_at.unwrap_or(persisted.created_at),
            access_count: persisted.access_count,
        };
        (persisted.file_path, entry)
    }

    pub(crate) fn to_persisted(&self, file_path: &Path) -> PersistedEntry {
        PersistedEntry {
            file_path: file_path.to_path_buf(),
            value: self.value.clone(),
            created_at: self.created_at,
            access_count: self.access_count,
            last_access_at: Some(self.last_access_at),
        }
    }
}

/// Header of the persisted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Format version, see [`DOCUMENT_VERSION`]
    pub version: u32,
    /// When the document was last written
    #[serde(default)]
    pub last_saved: Option<DateTime<Utc>>,
    /// Number of entries at the last save
    #[serde(default)]
    pub entry_count: usize,
}

/// One entry as it appears on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Path the value was computed for
    pub file_path: PathBuf,
    /// The cached value
    pub value: Value,
    /// When the value was computed
    pub created_at: DateTime<Utc>,
    /// Number of accesses
    #[serde(default = "default_access_count")]
    pub access_count: u64,
    /// Last access; older documents may omit it
    #[serde(default)]
    pub last_access_at: Option<DateTime<Utc>>,
}

const fn default_access_count() -> u64 {
    1
}

/// The unit the storage backend reads and writes atomically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    /// Document header
    pub metadata: DocumentMetadata,
    /// Entries indexed by cache key
    #[serde(default)]
    pub entries: BTreeMap<CacheKey, PersistedEntry>,
}

impl CacheDocument {
    /// An empty document at the current version
    #[must_use]
    pub fn empty() -> Self {
        Self {
            metadata: DocumentMetadata {
                version: DOCUMENT_VERSION,
                last_saved: None,
                entry_count: 0,
            },
            entries: BTreeMap::new(),
        }
    }

    /// Number of entries in the document
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the document holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_entry_starts_with_one_access() {
        let entry = CacheEntry::new(json!({"tempo": 120.0}));
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.created_at, entry.last_access_at);
    }

    #[test]
    fn touch_bumps_access() {
        let mut entry = CacheEntry::new(json!(1));
        let before = entry.last_access_at;
        entry.touch();
        assert_eq!(entry.access_count, 2);
        assert!(entry.last_access_at >= before);
    }

    #[test]
    fn persisted_entry_defaults_fill_gaps() {
        let raw = json!({
            "file_path": "/samples/kick.wav",
            "value": [1, 2, 3],
            "created_at": "2026-01-01T00:00:00Z"
        });
        let persisted: PersistedEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(persisted.access_count, 1);

        let (path, entry) = CacheEntry::from_persisted(persisted);
        assert_eq!(path, PathBuf::from("/samples/kick.wav"));
        assert_eq!(entry.last_access_at, entry.created_at);
    }

    #[test]
    fn entry_survives_persisted_form() {
        let mut entry = CacheEntry::new(json!({"mfcc": [[0.5, -1.25], [3.0, 4.5]]}));
        entry.touch();
        let persisted = entry.to_persisted(Path::new("/samples/pad.wav"));
        let (path, restored) = CacheEntry::from_persisted(persisted);
        assert_eq!(path, PathBuf::from("/samples/pad.wav"));
        assert_eq!(restored, entry);
    }

    #[test]
    fn empty_document_is_versioned() {
        let doc = CacheDocument::default();
        assert_eq!(doc.metadata.version, DOCUMENT_VERSION);
        assert!(doc.is_empty());
        assert!(doc.metadata.last_saved.is_none());
    }
}
