//! Storage backends for the persisted cache document
//!
//! The whole document is written on every save. Writes go to a sibling
//! temporary file which is synced and then renamed over the destination, so a
//! crash mid-write leaves either the previous document or the new one.

use crate::document::{CacheDocument, DOCUMENT_VERSION};
use crate::{Error, Result};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Reads and writes the cache document
///
/// Backends never fail loudly: load falls back to an empty document and the
/// mutating operations report success as a bool. They only borrow the
/// document for the duration of a call.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Load the last saved document, or an empty one if none is usable
    fn load(&self) -> CacheDocument;

    /// Atomically replace the stored document
    fn save(&self, document: &CacheDocument) -> bool;

    /// Remove the stored document
    fn clear(&self) -> bool;

    /// Size of the stored document in bytes, 0 if absent
    fn size_bytes(&self) -> u64;

    /// Where the document lives
    fn location(&self) -> &Path;
}

/// Serialization format of the cache file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFormat {
    /// MessagePack; compact, not human readable
    CompactBinary,
    /// Pretty-printed JSON
    StructuredText,
}

impl StorageFormat {
    /// Pick the format from the file extension: `.json` is text, anything
    /// else is binary
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::StructuredText,
            _ => Self::CompactBinary,
        }
    }

    /// Encode a document
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the document cannot be encoded.
    pub fn encode(self, document: &CacheDocument) -> Result<Vec<u8>> {
        match self {
            Self::CompactBinary => rmp_serde::to_vec_named(document)
                .map_err(|e| Error::serialization(format!("MessagePack encode failed: {e}"))),
            Self::StructuredText => serde_json::to_vec_pretty(document)
                .map_err(|e| Error::serialization(format!("JSON encode failed: {e}"))),
        }
    }

    /// Decode a document read from `path`
    ///
    /// # Errors
    ///
    /// Returns [`Error::CorruptStorage`] if the bytes are not a document of
    /// this format.
    pub fn decode(self, bytes: &[u8], path: &Path) -> Result<CacheDocument> {
        match self {
            Self::CompactBinary => rmp_serde::from_slice(bytes)
                .map_err(|e| Error::corrupt_storage(path, e.to_string())),
            Self::StructuredText => serde_json::from_slice(bytes)
                .map_err(|e| Error::corrupt_storage(path, e.to_string())),
        }
    }
}

/// Single-file storage backend
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    format: StorageFormat,
}

impl FileStorage {
    /// Storage at `path`, format chosen by extension
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = StorageFormat::from_path(&path);
        Self::with_format(path, format)
    }

    /// Storage at `path` with an explicit format
    #[must_use]
    pub fn with_format(path: impl Into<PathBuf>, format: StorageFormat) -> Self {
        let storage = Self {
            path: path.into(),
            format,
        };
        if let Err(e) = storage.ensure_parent() {
            warn!(error = %e, "Cache directory is not available yet");
        }
        storage
    }

    /// The format this backend writes
    #[must_use]
    pub fn format(&self) -> StorageFormat {
        self.format
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| OsString::from("cache"), OsString::from);
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
                .map_err(|e| Error::io(e, parent, "create_dir_all")),
            _ => Ok(()),
        }
    }

    /// Read and decode the stored document; `Ok(None)` if there is none
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not decode, or was
    /// written by an unsupported version.
    pub fn try_load(&self) -> Result<Option<CacheDocument>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &self.path, "read")),
        };
        let document = self.format.decode(&bytes, &self.path)?;
        if document.metadata.version != DOCUMENT_VERSION {
            return Err(Error::corrupt_storage(
                &self.path,
                format!(
                    "unsupported document version {} (expected {DOCUMENT_VERSION})",
                    document.metadata.version
                ),
            ));
        }
        Ok(Some(document))
    }

    /// Encode and atomically write `document`
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or any filesystem step fails. The
    /// destination is untouched in that case.
    pub fn try_save(&self, document: &CacheDocument) -> Result<()> {
        let bytes = self.format.encode(document)?;
        self.ensure_parent()?;

        let tmp_path = self.temp_path();
        let written = write_synced(&tmp_path, &bytes).and_then(|()| {
            fs::rename(&tmp_path, &self.path).map_err(|e| Error::io(e, &self.path, "rename"))
        });
        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).map_err(|e| Error::io(e, path, "create"))?;
    file.write_all(bytes)
        .map_err(|e| Error::io(e, path, "write"))?;
    file.sync_all().map_err(|e| Error::io(e, path, "sync"))
}

impl StorageBackend for FileStorage {
    fn load(&self) -> CacheDocument {
        match self.try_load() {
            Ok(Some(document)) => document,
            Ok(None) => {
                debug!(path = %self.path.display(), "No cache file yet, starting empty");
                CacheDocument::empty()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Unreadable cache file, starting fresh");
                CacheDocument::empty()
            }
        }
    }

    fn save(&self, document: &CacheDocument) -> bool {
        match self.try_save(document) {
            Ok(()) => true,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to save cache");
                false
            }
        }
    }

    fn clear(&self) -> bool {
        let _ = fs::remove_file(self.temp_path());
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to clear cache file");
                false
            }
        }
    }

    fn size_bytes(&self) -> u64 {
        fs::metadata(&self.path).map_or(0, |m| m.len())
    }

    fn location(&self) -> &Path {
        &self.path
    }
}
